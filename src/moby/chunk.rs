//! Turns the chunks coming out of a container's `/logs` endpoint into
//! individual log lines.
//!
//! For TTY containers every chunk is already one line of text. Otherwise the
//! runtime multiplexes stdout and stderr onto one stream, prefixing each line
//! with an 8 byte header:
//!
//! ```text
//! +------+---------+----------------------+
//! | type | 0 0 0   | length (u32, BE)     |
//! +------+---------+----------------------+
//! ```
//!
//! where `type` is 1 for stdout and 2 for stderr. Chunks may split headers
//! and bodies at arbitrary points, so incomplete frames are buffered until
//! the rest arrives.

use bytes::{Buf, BytesMut};

const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Stdout,
    Stderr,
    Tty,
}

impl Stream {
    pub const ALL: [Stream; 3] = [Stream::Stdout, Stream::Stderr, Stream::Tty];
}

impl AsRef<str> for Stream {
    fn as_ref(&self) -> &str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Tty => "tty",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("unknown stream type {stream_type} (chunk header {header:?})")]
    InvalidStreamType { stream_type: u8, header: [u8; HEADER_LEN] },
}

#[derive(Debug)]
pub struct ChunkParser {
    tty: bool,
    buf: BytesMut,
}

impl ChunkParser {
    pub fn new(tty: bool) -> Self {
        Self {
            tty,
            buf: BytesMut::new(),
        }
    }

    /// Feed one chunk, calling `sink` once for every complete line it
    /// finishes. Leftover bytes are kept for the next call.
    pub fn feed<F>(&mut self, chunk: &[u8], mut sink: F) -> Result<(), ChunkError>
    where
        F: FnMut(&[u8], Stream),
    {
        if self.tty {
            sink(chunk, Stream::Tty);
            return Ok(());
        }

        self.buf.extend_from_slice(chunk);

        while self.buf.len() >= HEADER_LEN {
            let header = [
                self.buf[0],
                self.buf[1],
                self.buf[2],
                self.buf[3],
                self.buf[4],
                self.buf[5],
                self.buf[6],
                self.buf[7],
            ];
            let stream = match header[0] {
                1 => Stream::Stdout,
                2 => Stream::Stderr,
                stream_type => {
                    return Err(ChunkError::InvalidStreamType {
                        stream_type,
                        header,
                    });
                }
            };
            let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;

            if self.buf.len() < HEADER_LEN + len {
                break;
            }

            self.buf.advance(HEADER_LEN);
            let line = self.buf.split_to(len);
            sink(&line, stream);
        }

        Ok(())
    }

    /// Number of bytes waiting for the rest of their frame.
    #[cfg(test)]
    fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Build one multiplexed frame. Used to fake runtime output in tests.
#[cfg(test)]
pub fn frame(stream: Stream, body: &[u8]) -> Vec<u8> {
    let stream_type = match stream {
        Stream::Stdout => 1,
        Stream::Stderr => 2,
        Stream::Tty => panic!("TTY output is not framed"),
    };
    let mut out = vec![stream_type, 0, 0, 0];
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn collect(parser: &mut ChunkParser, chunks: &[&[u8]]) -> Vec<(Vec<u8>, Stream)> {
        let mut lines = Vec::new();
        for chunk in chunks {
            parser
                .feed(chunk, |line, stream| lines.push((line.to_vec(), stream)))
                .expect("valid chunk");
        }
        lines
    }

    #[test]
    fn test_tty_chunks_are_lines() {
        let mut parser = ChunkParser::new(true);
        let lines = collect(&mut parser, &[b"first line\n", b"second"]);
        assert_eq!(
            lines,
            vec![
                (b"first line\n".to_vec(), Stream::Tty),
                (b"second".to_vec(), Stream::Tty),
            ]
        );
    }

    #[test]
    fn test_single_stdout_frame() {
        let mut parser = ChunkParser::new(false);
        let data = frame(Stream::Stdout, b"hello");
        let lines = collect(&mut parser, &[&data]);
        assert_eq!(lines, vec![(b"hello".to_vec(), Stream::Stdout)]);
        assert_eq!(parser.pending(), 0);
    }

    #[test]
    fn test_mixed_streams_in_one_chunk() {
        let mut parser = ChunkParser::new(false);
        let mut data = frame(Stream::Stdout, b"out");
        data.extend(frame(Stream::Stderr, b"err"));
        let lines = collect(&mut parser, &[&data]);
        assert_eq!(
            lines,
            vec![
                (b"out".to_vec(), Stream::Stdout),
                (b"err".to_vec(), Stream::Stderr),
            ]
        );
    }

    #[test]
    fn test_split_header_is_buffered() {
        let mut parser = ChunkParser::new(false);
        let data = frame(Stream::Stderr, b"split");
        let lines = collect(&mut parser, &[&data[..3]]);
        assert!(lines.is_empty());
        assert_eq!(parser.pending(), 3);

        let lines = collect(&mut parser, &[&data[3..]]);
        assert_eq!(lines, vec![(b"split".to_vec(), Stream::Stderr)]);
        assert_eq!(parser.pending(), 0);
    }

    #[test]
    fn test_split_body_is_buffered() {
        let mut parser = ChunkParser::new(false);
        let data = frame(Stream::Stdout, b"a longer log line");
        let lines = collect(&mut parser, &[&data[..12], &data[12..15]]);
        assert!(lines.is_empty());

        let lines = collect(&mut parser, &[&data[15..]]);
        assert_eq!(lines, vec![(b"a longer log line".to_vec(), Stream::Stdout)]);
    }

    #[test]
    fn test_empty_body_frame() {
        let mut parser = ChunkParser::new(false);
        let data = frame(Stream::Stdout, b"");
        let lines = collect(&mut parser, &[&data]);
        assert_eq!(lines, vec![(Vec::new(), Stream::Stdout)]);
    }

    #[test]
    fn test_unknown_stream_type_is_an_error() {
        let mut parser = ChunkParser::new(false);
        let data = [3u8, 0, 0, 0, 0, 0, 0, 1, b'x'];
        let result = parser.feed(&data, |_, _| panic!("no line expected"));
        assert!(matches!(
            result,
            Err(ChunkError::InvalidStreamType { stream_type: 3, .. })
        ));
    }

    #[quickcheck]
    fn prop_fragmentation_does_not_change_output(
        frames: Vec<(bool, Vec<u8>)>,
        cuts: Vec<usize>,
    ) -> bool {
        let mut data = Vec::new();
        for (is_stderr, body) in &frames {
            let stream = if *is_stderr {
                Stream::Stderr
            } else {
                Stream::Stdout
            };
            data.extend(frame(stream, body));
        }

        let mut whole = ChunkParser::new(false);
        let expected = collect(&mut whole, &[&data]);

        let mut cuts: Vec<usize> = cuts
            .into_iter()
            .map(|c| if data.is_empty() { 0 } else { c % data.len() })
            .collect();
        cuts.sort_unstable();
        cuts.dedup();

        let mut pieces: Vec<&[u8]> = Vec::new();
        let mut start = 0;
        for cut in cuts {
            pieces.push(&data[start..cut]);
            start = cut;
        }
        pieces.push(&data[start..]);

        let mut fragmented = ChunkParser::new(false);
        let actual = collect(&mut fragmented, &pieces);

        actual == expected && expected.len() == frames.len() && fragmented.pending() == 0
    }
}

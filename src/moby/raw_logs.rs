//! Streams a container's log endpoint without decoding it.
//!
//! bollard demultiplexes the stdout/stderr framing itself, which throws away
//! chunk boundaries and TTY handling that [`super::chunk::ChunkParser`] needs
//! to see. So logs go over a plain HTTP/1 connection to the daemon socket.

use std::path::PathBuf;

use bytes::Bytes;
use futures::StreamExt;
use http::{Request, StatusCode, header};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use url::Url;

use super::{LogStream, READ_TIMEOUT, RuntimeError};

const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";

/// Where the daemon listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerHost {
    Unix(PathBuf),
    Tcp(String),
}

impl DockerHost {
    /// Reads `DOCKER_HOST`, the same variable bollard's local defaults use.
    pub fn from_env() -> Result<Self, RuntimeError> {
        match std::env::var("DOCKER_HOST") {
            Ok(value) if !value.is_empty() => Self::parse(&value),
            _ => Self::parse(DEFAULT_DOCKER_HOST),
        }
    }

    pub fn parse(value: &str) -> Result<Self, RuntimeError> {
        let url = Url::parse(value)
            .map_err(|e| RuntimeError::Api(format!("invalid DOCKER_HOST {value:?}: {e}")))?;
        match url.scheme() {
            "unix" => Ok(Self::Unix(PathBuf::from(url.path()))),
            "tcp" | "http" => {
                let host = url
                    .host_str()
                    .ok_or_else(|| RuntimeError::Api(format!("DOCKER_HOST {value:?} has no host")))?;
                let port = url.port().unwrap_or(2375);
                Ok(Self::Tcp(format!("{host}:{port}")))
            }
            other => Err(RuntimeError::Api(format!(
                "unsupported DOCKER_HOST scheme {other:?}"
            ))),
        }
    }
}

fn transport(e: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::Transport(e.to_string())
}

pub async fn stream_logs(
    host: &DockerHost,
    id: &str,
    since: &str,
) -> Result<LogStream, RuntimeError> {
    let path = format!(
        "/containers/{id}/logs?follow=1&stdout=1&stderr=1&timestamps=1&since={since}"
    );
    match host {
        DockerHost::Unix(socket) => {
            let io = tokio::net::UnixStream::connect(socket)
                .await
                .map_err(transport)?;
            request(io, id, &path).await
        }
        DockerHost::Tcp(addr) => {
            let io = tokio::net::TcpStream::connect(addr)
                .await
                .map_err(transport)?;
            request(io, id, &path).await
        }
    }
}

async fn request<T>(io: T, id: &str, path: &str) -> Result<LogStream, RuntimeError>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .map_err(transport)?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            log::debug!("Log stream connection closed: {e}");
        }
    });

    let req = Request::builder()
        .uri(path)
        .header(header::HOST, "docker")
        .body(Empty::<Bytes>::new())
        .map_err(|e| RuntimeError::Api(e.to_string()))?;

    let response = tokio::time::timeout(READ_TIMEOUT, sender.send_request(req))
        .await
        .map_err(|_| RuntimeError::Timeout)?
        .map_err(transport)?;

    match response.status() {
        StatusCode::NOT_FOUND => return Err(RuntimeError::NotFound(id.to_string())),
        status if !status.is_success() => {
            return Err(RuntimeError::Api(format!(
                "GET {path} returned {status}"
            )));
        }
        _ => {}
    }

    Ok(body_stream(response.into_body()))
}

fn body_stream(body: Incoming) -> LogStream {
    futures::stream::unfold(Some(body), |state| async move {
        let mut body = state?;
        loop {
            match tokio::time::timeout(READ_TIMEOUT, body.frame()).await {
                Err(_) => return Some((Err(RuntimeError::Timeout), None)),
                Ok(None) => return None,
                Ok(Some(Err(e))) => return Some((Err(transport(e)), None)),
                Ok(Some(Ok(frame))) => {
                    // Trailers carry nothing we want.
                    if let Ok(data) = frame.into_data() {
                        return Some((Ok(data), Some(body)));
                    }
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unix_host() {
        assert_eq!(
            DockerHost::parse("unix:///var/run/docker.sock").unwrap(),
            DockerHost::Unix(PathBuf::from("/var/run/docker.sock"))
        );
    }

    #[test]
    fn test_parse_tcp_host() {
        assert_eq!(
            DockerHost::parse("tcp://10.0.0.1:2376").unwrap(),
            DockerHost::Tcp("10.0.0.1:2376".to_string())
        );
        assert_eq!(
            DockerHost::parse("tcp://docker.internal").unwrap(),
            DockerHost::Tcp("docker.internal:2375".to_string())
        );
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        assert!(matches!(
            DockerHost::parse("npipe:////./pipe/docker_engine"),
            Err(RuntimeError::Api(_))
        ));
    }
}

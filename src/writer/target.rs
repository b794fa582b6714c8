use std::fmt;
use std::io;
use std::net::IpAddr;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// One endpoint the writer can connect to.
#[derive(Debug)]
pub struct Target {
    addr: String,
    port: u16,
    socket: Option<TcpStream>,
    peer: Option<String>,
}

impl Target {
    pub fn new(addr: impl Into<String>, port: u16) -> Self {
        Self {
            addr: addr.into(),
            port,
            socket: None,
            peer: None,
        }
    }

    pub async fn connect(&mut self) -> io::Result<()> {
        if self.socket.is_none() {
            let socket = TcpStream::connect((self.addr.as_str(), self.port)).await?;
            socket.set_nodelay(true)?;
            self.socket = Some(socket);
        }
        Ok(())
    }

    /// Whether the connection still looks usable.
    ///
    /// The writer never reads, so a peer that closed its end is only
    /// noticed here: anything readable (data or EOF) means the peer is not
    /// speaking our protocol any more.
    pub fn is_connected(&self) -> bool {
        let Some(socket) = &self.socket else {
            return false;
        };
        let mut probe = [0u8; 1];
        matches!(socket.try_read(&mut probe), Err(e) if e.kind() == io::ErrorKind::WouldBlock)
    }

    pub async fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        socket.write_all(line).await?;
        socket.flush().await
    }

    pub fn close(&mut self) {
        self.socket = None;
        self.peer = None;
    }

    /// The address actually connected to, remembered so it can still be
    /// named after the peer goes away.
    pub fn describe_peer(&mut self) -> String {
        if self.peer.is_none() {
            self.peer = self
                .socket
                .as_ref()
                .and_then(|s| s.peer_addr().ok())
                .map(|addr| addr.to_string());
        }
        self.peer.clone().unwrap_or_else(|| self.to_string())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => write!(f, "[{}]:{}", ip, self.port),
            _ => write!(f, "{}:{}", self.addr, self.port),
        }
    }
}

use std::io;
use std::net::SocketAddr;

use serde_json::Value;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, info};

use super::protocol::{Message, NO_REQUEST_ID};
use super::wire;
use crate::error::{Result, RtError};

/// A request line that arrived intact but could not be understood.
///
/// `id` is the correlation id if one could be recovered, `0` otherwise.
#[derive(Debug)]
pub struct BadRequest {
    pub id: u64,
    pub error: RtError,
}

/// Server end of the command channel.
///
/// Serves one client connection at a time. The protocol is half-duplex:
/// every `get_request` must be followed by exactly one `send_reply`.
pub struct MessageServer {
    listener: TcpListener,
    conn: Option<BufReader<TcpStream>>,
    peer: Option<SocketAddr>,
}

impl MessageServer {
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            conn: None,
            peer: None,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Wait for the next client, replacing any previous connection.
    pub async fn accept(&mut self) -> io::Result<SocketAddr> {
        self.conn = None;
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        info!(%peer, "command client connected");
        self.conn = Some(BufReader::new(stream));
        self.peer = Some(peer);
        Ok(peer)
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Block until the next request arrives.
    ///
    /// The outer error is a transport failure; the inner one is a malformed
    /// request that still deserves a reply.
    pub async fn get_request(&mut self) -> Result<std::result::Result<Message, BadRequest>> {
        let line = match self.conn.as_mut() {
            Some(conn) => wire::read_line(conn).await,
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no client connected")),
        };
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                self.drop_connection();
                return Err(e.into());
            }
        };
        Ok(parse_request(&line))
    }

    pub async fn send_reply(&mut self, reply: &Message) -> Result<()> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no client connected"))?;
        if let Err(e) = wire::write_line(conn.get_mut(), reply).await {
            self.drop_connection();
            return Err(e.into());
        }
        debug!(id = reply.id, event = ?reply.event_type, "reply sent");
        Ok(())
    }

    fn drop_connection(&mut self) {
        if let Some(peer) = self.peer.take() {
            info!(%peer, "command client disconnected");
        }
        self.conn = None;
    }
}

fn parse_request(line: &str) -> std::result::Result<Message, BadRequest> {
    let value: Value = serde_json::from_str(line).map_err(|e| BadRequest {
        id: NO_REQUEST_ID,
        error: RtError::protocol(format!("unparseable request: {}", e)),
    })?;
    let id = value
        .get("id")
        .and_then(Value::as_u64)
        .unwrap_or(NO_REQUEST_ID);
    serde_json::from_value(value).map_err(|e| BadRequest {
        id,
        error: RtError::protocol(format!("Field not found: {}", e)),
    })
}

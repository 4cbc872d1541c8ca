use std::io;
use std::net::SocketAddr;

use serde_json::Value;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::protocol::{RelayRecord, RelayRequest, RelayResponse, STATUS_FORBIDDEN};
use crate::error::{Result, RtError};
use crate::ipc::wire;

/// Compute-side end of the relay: accepts the scanner's connection and asks
/// it for files.
#[derive(Debug)]
pub struct RelayPeer {
    conn: BufReader<TcpStream>,
    peer: SocketAddr,
    next_req: u64,
}

impl RelayPeer {
    /// Wait for the relay service to connect.
    pub async fn accept(listener: &TcpListener) -> io::Result<Self> {
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true)?;
        info!(%peer, "relay service connected");
        Ok(Self {
            conn: BufReader::new(stream),
            peer,
            next_req: 1,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn init_watch(&mut self, dir: &str, pattern: &str, min_file_size: u64) -> Result<()> {
        self.request(RelayRequest::init(dir, pattern, min_file_size))
            .await
            .map(|_| ())
    }

    /// Fetch a file. Blocks until the scanner has written it.
    pub async fn get_file(&mut self, filename: &str) -> Result<Vec<u8>> {
        self.request(RelayRequest::get(filename))
            .await?
            .decode_data()
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.request(RelayRequest::ping()).await.map(|_| ())
    }

    /// Send a request tagged with a fresh `reqId` and wait for the response
    /// that echoes it. Responses for other ids are stale and skipped.
    pub async fn request(&mut self, mut record: RelayRecord) -> Result<RelayResponse> {
        let req_id = self.next_req;
        self.next_req += 1;
        record.insert("reqId".to_string(), Value::from(req_id));
        wire::write_line(self.conn.get_mut(), &record).await?;

        loop {
            let reply: RelayRecord = wire::read_json(&mut self.conn).await?;
            if reply.get("reqId").and_then(Value::as_u64) != Some(req_id) {
                warn!(req_id, got = ?reply.get("reqId"), "skipping uncorrelated relay response");
                continue;
            }
            let response = RelayResponse::from_record(&reply)?;
            debug!(req_id, status = response.status, "relay response");
            return check_status(response);
        }
    }
}

fn check_status(response: RelayResponse) -> Result<RelayResponse> {
    if response.is_ok() {
        return Ok(response);
    }
    let text = response
        .error
        .unwrap_or_else(|| format!("relay status {}", response.status));
    if response.status == STATUS_FORBIDDEN {
        Err(RtError::access_denied(text))
    } else {
        Err(RtError::domain(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn connected() -> (RelayPeer, BufReader<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let peer = RelayPeer::accept(&listener).await.unwrap();
        (peer, BufReader::new(client.await.unwrap()))
    }

    #[tokio::test]
    async fn stale_responses_are_skipped() {
        let (mut peer, mut relay) = connected().await;
        let responder = tokio::spawn(async move {
            let request: RelayRecord = wire::read_json(&mut relay).await.unwrap();
            let stale = json!({"cmd": "ping", "reqId": 999, "status": 200});
            wire::write_line(relay.get_mut(), &stale).await.unwrap();
            let fresh = RelayResponse::ok().merge_echo(&request);
            wire::write_line(relay.get_mut(), &fresh).await.unwrap();
            request
        });

        peer.ping().await.unwrap();
        let request = responder.await.unwrap();
        assert_eq!(request["reqId"], 1);
    }

    #[tokio::test]
    async fn forbidden_status_is_access_denied() {
        let (mut peer, mut relay) = connected().await;
        tokio::spawn(async move {
            let request: RelayRecord = wire::read_json(&mut relay).await.unwrap();
            let resp = RelayResponse::from_error(&RtError::access_denied("outside roots"))
                .merge_echo(&request);
            wire::write_line(relay.get_mut(), &resp).await.unwrap();
        });

        let result = peer.get_file("/etc/passwd").await;
        match result {
            Err(RtError::AccessDenied(text)) => assert_eq!(text, "outside roots"),
            other => panic!("expected access denied, got {:?}", other),
        }
    }
}

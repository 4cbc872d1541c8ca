use std::time::Duration;

use serde_json::Value;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::handler::{FileAccess, RelayHandler};
use super::protocol::{RelayRecord, RelayResponse};
use crate::error::{Result, RtError};
use crate::ipc::wire;
use crate::watch::FileWatch;

/// Scanner-side end of the relay. Connects out to the peer and keeps
/// reconnecting; it never stops on its own.
#[derive(Debug)]
pub struct RelayService<W, F> {
    handler: RelayHandler<W, F>,
    peer_addr: String,
    retry: Duration,
}

impl<W: FileWatch, F: FileAccess> RelayService<W, F> {
    pub fn new(handler: RelayHandler<W, F>, peer_addr: impl Into<String>, retry: Duration) -> Self {
        Self {
            handler,
            peer_addr: peer_addr.into(),
            retry,
        }
    }

    pub fn handler(&self) -> &RelayHandler<W, F> {
        &self.handler
    }

    /// Connect, serve until the connection drops, wait `retry`, repeat.
    pub async fn run_forever(&mut self) {
        loop {
            debug!(addr = %self.peer_addr, "trying relay connection");
            match TcpStream::connect(&self.peer_addr).await {
                Ok(stream) => {
                    info!(addr = %self.peer_addr, "relay connected");
                    if let Err(e) = self.serve_connection(stream).await {
                        info!(error = %e, "relay connection ended");
                    }
                }
                Err(e) => debug!(addr = %self.peer_addr, error = %e, "relay connect failed"),
            }
            tokio::time::sleep(self.retry).await;
        }
    }

    /// Answer requests on one connection until it closes.
    pub async fn serve_connection(&mut self, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        let mut conn = BufReader::new(stream);
        loop {
            let line = wire::read_line(&mut conn).await?;
            let response = match parse_record(&line) {
                Ok(request) => self.handler.handle(&request).await,
                Err(e) => {
                    warn!(error = %e, "unparseable relay request");
                    RelayResponse::from_error(&e).merge_echo(&RelayRecord::new())
                }
            };
            wire::write_line(conn.get_mut(), &response).await?;
        }
    }
}

fn parse_record(line: &str) -> Result<RelayRecord> {
    match serde_json::from_str(line) {
        Ok(Value::Object(record)) => Ok(record),
        Ok(_) => Err(RtError::protocol("relay request must be a JSON object")),
        Err(e) => Err(RtError::protocol(format!("unparseable request: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::allowlist::AllowList;
    use crate::relay::protocol::RelayRequest;
    use crate::watch::{FileWatcher, WatchStrategy};
    use tokio::net::TcpListener;

    #[test]
    fn non_object_request_is_protocol_error() {
        assert!(matches!(parse_record("[1,2]"), Err(RtError::Protocol(_))));
        assert!(matches!(parse_record("{"), Err(RtError::Protocol(_))));
        assert!(parse_record(r#"{"cmd":"ping"}"#).is_ok());
    }

    #[tokio::test]
    async fn service_reconnects_after_peer_drops() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let handler = RelayHandler::new(
            FileWatcher::new(WatchStrategy::Poll),
            AllowList::new(["/tmp"], [".dcm"]),
        );
        let mut service = RelayService::new(handler, addr, Duration::from_millis(20));
        let task = tokio::spawn(async move { service.run_forever().await });

        for _ in 0..2 {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = BufReader::new(stream);
            wire::write_line(conn.get_mut(), &RelayRequest::ping())
                .await
                .unwrap();
            let resp: RelayRecord = wire::read_json(&mut conn).await.unwrap();
            assert_eq!(resp["status"], 200);
            // Dropping the connection sends the service back to its retry loop
        }
        task.abort();
    }
}

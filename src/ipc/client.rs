use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, warn};

use super::protocol::{Message, ReplyFields};
use super::wire;
use crate::error::{Result, RtError};

/// Anything that can carry one request and return its correlated reply.
///
/// The run driver talks to this seam so it can be exercised without a socket.
pub trait CommandChannel: Send {
    fn request(&mut self, msg: Message) -> impl Future<Output = Result<Message>> + Send;
}

/// Client end of the command channel.
#[derive(Debug)]
pub struct MessageClient {
    reader: BufReader<TcpStream>,
    next_id: u64,
}

impl MessageClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            reader: BufReader::new(stream),
            next_id: 1,
        })
    }

    /// Connect, retrying while a freshly started server is still binding.
    pub async fn connect_with_retry(
        addr: &str,
        attempts: u32,
        delay: Duration,
    ) -> io::Result<Self> {
        let mut last_err = None;
        for attempt in 1..=attempts.max(1) {
            match Self::connect(addr).await {
                Ok(client) => return Ok(client),
                Err(e) => {
                    debug!(addr, attempt, error = %e, "connect failed, retrying");
                    last_err = Some(e);
                    tokio::time::sleep(delay).await;
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no connect attempt")))
    }

    /// Send one request and block for its reply.
    ///
    /// The request gets a fresh correlation id. A reply carrying any other id
    /// means the channel is out of step and is reported as a transport error.
    pub async fn send_request(&mut self, mut msg: Message) -> Result<Message> {
        msg.id = self.next_id;
        self.next_id += 1;

        wire::write_line(self.reader.get_mut(), &msg).await?;
        let reply: Message = wire::read_json(&mut self.reader).await?;

        if reply.id != msg.id {
            return Err(RtError::broken_channel(format!(
                "reply id {} does not match request id {}",
                reply.id, msg.id
            )));
        }
        Ok(reply)
    }

    /// Ask the server to load `model_type`.
    pub async fn init_model(&mut self, model_type: &str) -> Result<()> {
        let reply = self.send_request(Message::init(model_type)).await?;
        expect_success(reply).map(|_| ())
    }

    /// Ask the server loop to exit. The server acknowledges before it stops.
    pub async fn shutdown_server(&mut self) -> Result<()> {
        match self.send_request(Message::shutdown()).await {
            Ok(_) => Ok(()),
            Err(RtError::Transport(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!("server closed before acknowledging shutdown");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl CommandChannel for MessageClient {
    async fn request(&mut self, msg: Message) -> Result<Message> {
        self.send_request(msg).await
    }
}

/// Turn an error reply into a domain error.
pub fn expect_success(reply: Message) -> Result<Message> {
    if reply.is_error() {
        return Err(RtError::domain(reply.error_text()));
    }
    Ok(reply)
}

/// Typed view of a success reply. Replies without fields carry nothing to
/// record.
pub fn reply_fields(reply: &Message) -> Result<ReplyFields> {
    if reply.fields.is_empty() {
        return Ok(ReplyFields::default());
    }
    reply.fields_as()
}

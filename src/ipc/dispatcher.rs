use tracing::{debug, error, info, warn};

use super::protocol::{InitFields, Message, MsgType};
use super::server::{BadRequest, MessageServer};
use crate::error::{Result, RtError};
use crate::model::{Model, ModelRegistry};

/// Lifecycle of the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatcherState {
    /// No model loaded; commands are refused.
    Uninitialized,
    /// A model is loaded and receives commands.
    Ready { model: String },
    /// A shutdown request was processed.
    Terminated,
}

/// Whether the loop should keep serving after a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Routes requests to the loaded model and wraps every outcome into exactly
/// one reply.
pub struct CommandDispatcher {
    registry: ModelRegistry,
    model: Option<(String, Box<dyn Model>)>,
    terminated: bool,
}

impl CommandDispatcher {
    pub fn new(registry: ModelRegistry) -> Self {
        Self {
            registry,
            model: None,
            terminated: false,
        }
    }

    pub fn state(&self) -> DispatcherState {
        if self.terminated {
            return DispatcherState::Terminated;
        }
        match &self.model {
            Some((name, _)) => DispatcherState::Ready {
                model: name.clone(),
            },
            None => DispatcherState::Uninitialized,
        }
    }

    /// Handle one request. Never fails: errors become error replies keyed to
    /// the request id.
    pub fn handle(&mut self, msg: &Message) -> (Message, Flow) {
        match self.dispatch(msg) {
            Ok((mut reply, flow)) => {
                // Correlation is owned here, not by the model
                reply.id = msg.id;
                reply.msg_type = MsgType::Reply;
                (reply, flow)
            }
            Err(err) => {
                warn!(id = msg.id, error = %err, "request failed");
                (Message::error_reply(msg.id, &err), Flow::Continue)
            }
        }
    }

    /// Reply for a request that could not be parsed.
    pub fn handle_bad_request(&self, bad: &BadRequest) -> Message {
        warn!(id = bad.id, error = %bad.error, "malformed request");
        Message::error_reply(bad.id, &bad.error)
    }

    fn dispatch(&mut self, msg: &Message) -> Result<(Message, Flow)> {
        debug!(id = msg.id, kind = ?msg.msg_type, event = ?msg.event_type, "request received");
        match msg.msg_type {
            MsgType::Init => {
                let fields = InitFields {
                    model_type: msg.field_as("modelType")?,
                };
                let model = self.registry.create(&fields.model_type)?;
                info!(model = %fields.model_type, "model loaded");
                self.model = Some((fields.model_type, model));
                Ok((Message::success_reply(msg.id), Flow::Continue))
            }
            MsgType::Command => {
                let (_, model) = self
                    .model
                    .as_mut()
                    .ok_or_else(|| RtError::domain("No model object exists"))?;
                Ok((model.handle_message(msg)?, Flow::Continue))
            }
            MsgType::Shutdown => {
                info!("shutdown requested");
                self.terminated = true;
                Ok((Message::success_reply(msg.id), Flow::Exit))
            }
            MsgType::Reply => Err(RtError::protocol(format!(
                "unknown request type '{:?}'",
                msg.msg_type
            ))),
        }
    }

    /// Serve the currently connected client until it disconnects or asks for
    /// shutdown. Returns the transport error in the first case.
    pub async fn run_connection(&mut self, server: &mut MessageServer) -> Result<Flow> {
        loop {
            let (reply, flow) = match server.get_request().await? {
                Ok(request) => self.handle(&request),
                Err(bad) => (self.handle_bad_request(&bad), Flow::Continue),
            };
            server.send_reply(&reply).await?;
            if flow == Flow::Exit {
                return Ok(Flow::Exit);
            }
        }
    }

    /// Accept clients one after another until a shutdown request arrives.
    /// A dropped client does not end the loop; the loaded model is kept.
    pub async fn serve(&mut self, server: &mut MessageServer) -> Result<()> {
        info!(addr = ?server.local_addr().ok(), "command server listening");
        loop {
            server.accept().await?;
            match self.run_connection(server).await {
                Ok(Flow::Exit) => {
                    info!("command server shutting down");
                    return Ok(());
                }
                Ok(Flow::Continue) => {}
                Err(e) if e.is_transport() => {
                    debug!(error = %e, "connection ended");
                }
                Err(e) => {
                    error!(error = %e, "command server failed");
                    return Err(e);
                }
            }
        }
    }
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("registry", &self.registry)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::{MsgEvent, SessionFields};
    use crate::run::IdentityContext;

    fn with_id(mut msg: Message, id: u64) -> Message {
        msg.id = id;
        msg
    }

    fn session_command(id: u64) -> Message {
        let ids = IdentityContext::new("s1");
        let cfg = SessionFields {
            session_id: "s1".to_string(),
        };
        with_id(
            Message::command(MsgEvent::StartSession, &ids, &cfg).unwrap(),
            id,
        )
    }

    #[test]
    fn one_reply_per_request_with_matching_id() {
        let mut dispatcher = CommandDispatcher::new(ModelRegistry::new());
        let requests = vec![with_id(Message::init("base"), 1), session_command(2)];

        for request in &requests {
            let (reply, flow) = dispatcher.handle(request);
            assert_eq!(reply.id, request.id);
            assert_eq!(reply.msg_type, MsgType::Reply);
            assert_eq!(reply.event_type, MsgEvent::Success);
            assert_eq!(flow, Flow::Continue);
        }
        assert_eq!(
            dispatcher.state(),
            DispatcherState::Ready {
                model: "base".to_string()
            }
        );
    }

    #[test]
    fn command_before_init_is_refused() {
        let mut dispatcher = CommandDispatcher::new(ModelRegistry::new());
        for id in 1..=3 {
            let (reply, _) = dispatcher.handle(&session_command(id));
            assert!(reply.is_error());
            assert_eq!(reply.id, id);
            assert_eq!(reply.error_text(), "No model object exists");
            assert_eq!(dispatcher.state(), DispatcherState::Uninitialized);
        }
    }

    #[test]
    fn unknown_model_leaves_state_unchanged() {
        let mut dispatcher = CommandDispatcher::new(ModelRegistry::new());
        dispatcher.handle(&with_id(Message::init("base"), 1));

        let (reply, _) = dispatcher.handle(&with_id(Message::init("nope"), 2));
        assert!(reply.is_error());
        assert!(reply.error_text().contains("nope"));
        assert_eq!(
            dispatcher.state(),
            DispatcherState::Ready {
                model: "base".to_string()
            }
        );
    }

    #[test]
    fn init_without_model_type_is_field_error() {
        let mut dispatcher = CommandDispatcher::new(ModelRegistry::new());
        let msg = with_id(Message::new(MsgType::Init, MsgEvent::NoEvent), 4);
        let (reply, _) = dispatcher.handle(&msg);
        assert!(reply.is_error());
        assert_eq!(reply.id, 4);
        assert!(
            reply.error_text().contains("Field not found: modelType"),
            "{}",
            reply.error_text()
        );
        assert_eq!(dispatcher.state(), DispatcherState::Uninitialized);
    }

    #[test]
    fn model_error_keeps_dispatcher_ready() {
        let mut dispatcher = CommandDispatcher::new(ModelRegistry::new());
        dispatcher.handle(&with_id(Message::init("base"), 1));

        // EndRun with no active run is a domain failure inside the model
        let ids = IdentityContext::new("s1");
        let end = with_id(
            Message::command(MsgEvent::EndRun, &ids, &serde_json::json!({})).unwrap(),
            2,
        );
        let (reply, flow) = dispatcher.handle(&end);
        assert!(reply.is_error());
        assert_eq!(flow, Flow::Continue);
        assert!(matches!(dispatcher.state(), DispatcherState::Ready { .. }));
    }

    #[test]
    fn shutdown_acknowledges_and_exits() {
        let mut dispatcher = CommandDispatcher::new(ModelRegistry::new());
        let (reply, flow) = dispatcher.handle(&with_id(Message::shutdown(), 8));
        assert_eq!(reply.id, 8);
        assert!(!reply.is_error());
        assert_eq!(flow, Flow::Exit);
        assert_eq!(dispatcher.state(), DispatcherState::Terminated);
    }

    #[test]
    fn reply_message_as_request_is_rejected() {
        let mut dispatcher = CommandDispatcher::new(ModelRegistry::new());
        let (reply, _) = dispatcher.handle(&Message::success_reply(6));
        assert!(reply.is_error());
        assert_eq!(reply.id, 6);
    }
}

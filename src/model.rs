//! Models the command dispatcher can load.
//!
//! Actual classification and training live outside this crate and plug in
//! through [`Model`]. `base` is always available: it checks that the protocol
//! nests correctly and acknowledges each step with output lines.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{Result, RtError};
use crate::ipc::protocol::{
    BlockFields, BlockGroupFields, Message, MsgEvent, ReplyFields, RunFields, SessionFields,
    TrainFields, TrialFields,
};
use crate::run::IdentityContext;

/// A loaded model. Errors must be `Domain` or `Protocol`; the dispatcher turns
/// them into error replies.
pub trait Model: Send {
    fn handle_message(&mut self, msg: &Message) -> Result<Message>;
}

pub type ModelFactory = fn() -> Box<dyn Model>;

/// Name → constructor table consulted on `Init`.
#[derive(Clone)]
pub struct ModelRegistry {
    factories: BTreeMap<String, ModelFactory>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            factories: BTreeMap::new(),
        };
        registry.register("base", || -> Box<dyn Model> { Box::new(BaseModel::default()) });
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: ModelFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn Model>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| RtError::domain(format!("unknown model type '{}'", name)))
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models", &self.names())
            .finish()
    }
}

/// Protocol-checking model with no learning behind it.
#[derive(Debug, Default)]
pub struct BaseModel {
    session_id: Option<String>,
    run_id: Option<u32>,
    blk_grp_id: Option<u32>,
    block_id: Option<u32>,
    trials_received: u32,
}

impl BaseModel {
    fn require<T: Copy>(value: Option<T>, scope: &str) -> Result<T> {
        value.ok_or_else(|| RtError::domain(format!("no active {}", scope)))
    }

    fn handle_event(&mut self, msg: &Message, ids: &IdentityContext) -> Result<Vec<String>> {
        let line = match msg.event_type {
            MsgEvent::StartSession => {
                let cfg: SessionFields = msg.field_as("cfg")?;
                let line = format!("session {} started", cfg.session_id);
                self.session_id = Some(cfg.session_id);
                line
            }
            MsgEvent::EndSession => {
                let session = self
                    .session_id
                    .take()
                    .ok_or_else(|| RtError::domain("no active session"))?;
                format!("session {} ended", session)
            }
            MsgEvent::StartRun => {
                let cfg: RunFields = msg.field_as("cfg")?;
                if let Some(active) = self.run_id {
                    return Err(RtError::domain(format!("run {} still active", active)));
                }
                self.run_id = Some(cfg.run_id);
                self.trials_received = 0;
                format!("run {} started, scan {}", cfg.run_id, cfg.scan_num)
            }
            MsgEvent::EndRun => {
                let run = Self::require(self.run_id.take(), "run")?;
                format!("run {} ended after {} trials", run, self.trials_received)
            }
            MsgEvent::StartBlockGroup => {
                let cfg: BlockGroupFields = msg.field_as("cfg")?;
                Self::require(self.run_id, "run")?;
                if let Some(active) = self.blk_grp_id {
                    return Err(RtError::domain(format!("block group {} still active", active)));
                }
                self.blk_grp_id = Some(cfg.blk_grp_id);
                format!("block group {} started", cfg.blk_grp_id)
            }
            MsgEvent::EndBlockGroup => {
                let grp = Self::require(self.blk_grp_id.take(), "block group")?;
                format!("block group {} ended", grp)
            }
            MsgEvent::StartBlock => {
                let cfg: BlockFields = msg.field_as("cfg")?;
                Self::require(self.blk_grp_id, "block group")?;
                if let Some(active) = self.block_id {
                    return Err(RtError::domain(format!("block {} still active", active)));
                }
                self.block_id = Some(cfg.block_id);
                format!("block {} started", cfg.block_id)
            }
            MsgEvent::EndBlock => {
                let block = Self::require(self.block_id.take(), "block")?;
                format!("block {} ended", block)
            }
            MsgEvent::TrialData => {
                let cfg: TrialFields = msg.field_as("cfg")?;
                Self::require(self.block_id, "block")?;
                self.trials_received += 1;
                let values = cfg.features.as_ref().map_or(0, Vec::len);
                let bytes = msg.data.as_ref().map_or(0, Vec::len);
                format!(
                    "trial {} vol {}: {} values, {} bytes",
                    cfg.tr_id, cfg.vol, values, bytes
                )
            }
            MsgEvent::TrainModel => {
                let cfg: TrainFields = msg.field_as("cfg")?;
                let run = Self::require(self.run_id, "run")?;
                if let Some(grp) = self.blk_grp_id {
                    return Err(RtError::domain(format!(
                        "cannot train while block group {} is active",
                        grp
                    )));
                }
                let refs: Vec<String> = cfg
                    .blk_grp_refs
                    .iter()
                    .map(|r| format!("({},{})", r.run, r.phase))
                    .collect();
                format!("run {} trained on {}", run, refs.join(" "))
            }
            other => return Err(RtError::domain(format!("unsupported event {:?}", other))),
        };
        debug!(session = %ids.session_id, event = ?msg.event_type, "base model handled event");
        Ok(vec![line])
    }
}

impl Model for BaseModel {
    fn handle_message(&mut self, msg: &Message) -> Result<Message> {
        let ids: IdentityContext = msg.field_as("ids")?;
        let outputlns = self.handle_event(msg, &ids)?;
        let mut reply = Message::success_reply(msg.id);
        reply.set_fields(&ReplyFields {
            outputlns,
            predict: None,
        })?;
        Ok(reply)
    }
}

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{Result, RtError};
use crate::run::IdentityContext;

/// Correlation id meaning "no associated request".
pub const NO_REQUEST_ID: u64 = 0;

/// Kind of message on the command channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgType {
    Init,
    Command,
    Reply,
    Shutdown,
}

/// What a command asks for, or how a reply turned out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgEvent {
    Success,
    Error,
    NoEvent,
    StartSession,
    EndSession,
    StartRun,
    EndRun,
    StartBlockGroup,
    EndBlockGroup,
    StartBlock,
    EndBlock,
    TrialData,
    TrainModel,
}

/// A request or reply on the command channel.
///
/// `fields` carries the structured payload; use [`Message::fields_as`] to
/// validate it into one of the typed records below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    #[serde(rename = "type")]
    pub msg_type: MsgType,
    pub event_type: MsgEvent,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default, with = "base64_blob", skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
}

impl Message {
    pub fn new(msg_type: MsgType, event_type: MsgEvent) -> Self {
        Self {
            id: NO_REQUEST_ID,
            msg_type,
            event_type,
            fields: Map::new(),
            data: None,
        }
    }

    pub fn init(model_type: impl Into<String>) -> Self {
        let mut msg = Self::new(MsgType::Init, MsgEvent::NoEvent);
        msg.fields
            .insert("modelType".to_string(), Value::String(model_type.into()));
        msg
    }

    /// A scoped command carrying the current identity and a typed config payload.
    pub fn command<T: Serialize>(
        event: MsgEvent,
        ids: &IdentityContext,
        cfg: &T,
    ) -> Result<Self> {
        let mut msg = Self::new(MsgType::Command, event);
        msg.fields.insert("ids".to_string(), to_value(ids)?);
        msg.fields.insert("cfg".to_string(), to_value(cfg)?);
        Ok(msg)
    }

    pub fn shutdown() -> Self {
        Self::new(MsgType::Shutdown, MsgEvent::NoEvent)
    }

    pub fn success_reply(id: u64) -> Self {
        let mut msg = Self::new(MsgType::Reply, MsgEvent::Success);
        msg.id = id;
        msg
    }

    /// Error reply. The message text travels in `data`, as the peer expects.
    pub fn error_reply(id: u64, error: &RtError) -> Self {
        let mut msg = Self::new(MsgType::Reply, MsgEvent::Error);
        msg.id = id;
        msg.data = Some(error.to_string().into_bytes());
        msg
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn is_error(&self) -> bool {
        self.event_type == MsgEvent::Error
    }

    /// Text carried by an error reply.
    pub fn error_text(&self) -> String {
        self.data
            .as_deref()
            .map(|d| String::from_utf8_lossy(d).into_owned())
            .unwrap_or_else(|| "unspecified error".to_string())
    }

    /// Look up a required top-level field.
    pub fn field(&self, name: &str) -> Result<&Value> {
        self.fields
            .get(name)
            .filter(|v| !v.is_null())
            .ok_or_else(|| RtError::protocol(format!("Field not found: {}", name)))
    }

    /// Validate a top-level field into a typed record.
    pub fn field_as<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let value = self.field(name)?;
        serde_json::from_value(value.clone())
            .map_err(|e| RtError::protocol(format!("invalid field '{}': {}", name, e)))
    }

    /// Validate the whole field map into a typed record.
    pub fn fields_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.fields.clone()))
            .map_err(|e| RtError::protocol(format!("invalid message fields: {}", e)))
    }

    pub fn set_fields<T: Serialize>(&mut self, fields: &T) -> Result<()> {
        match to_value(fields)? {
            Value::Object(map) => {
                self.fields = map;
                Ok(())
            }
            other => Err(RtError::protocol(format!(
                "message fields must be an object, got {}",
                other
            ))),
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| RtError::protocol(e.to_string()))
}

/// Payload of an `Init` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitFields {
    pub model_type: String,
}

/// One block-group used as training input: `(run, phase)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlkGrpRef {
    pub run: u32,
    pub phase: u32,
}

impl BlkGrpRef {
    pub fn new(run: u32, phase: u32) -> Self {
        Self { run, phase }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFields {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFields {
    pub run_id: u32,
    pub scan_num: i32,
    pub disdaqs: u32,
    #[serde(rename = "TRTime")]
    pub tr_time: u32,
    pub block_groups: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockGroupFields {
    pub blk_grp_id: u32,
    pub blocks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockFields {
    pub block_id: u32,
    pub trials: usize,
}

/// Per-trial payload. Raw scanner bytes, when shipped, ride in `Message::data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialFields {
    pub tr_id: u32,
    pub vol: u32,
    pub file_num: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainFields {
    pub blk_grp_refs: Vec<BlkGrpRef>,
}

/// Prediction for one trial volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub vol: u32,
    /// Predicted category separation value.
    pub catsep: f64,
}

/// Payload of a success reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyFields {
    #[serde(default)]
    pub outputlns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predict: Option<Prediction>,
}

mod base64_blob {
    use super::*;

    pub fn serialize<S: Serializer>(data: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match data {
            Some(bytes) => s.serialize_str(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, RtError};

pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_FORBIDDEN: u16 = 403;

/// A relay request or response: a flat JSON object with a `cmd` field.
pub type RelayRecord = Map<String, Value>;

/// Recognized relay commands, validated from a [`RelayRecord`].
#[derive(Debug, Clone, PartialEq)]
pub enum RelayRequest {
    Init {
        dir: String,
        pattern: String,
        min_file_size: u64,
    },
    Get {
        filename: String,
    },
    Ping,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitArgs {
    img_dir: Option<String>,
    file_pattern: Option<String>,
    min_file_size: Option<u64>,
}

#[derive(Deserialize)]
struct GetArgs {
    filename: Option<String>,
}

impl RelayRequest {
    /// Unknown commands and missing arguments are protocol errors.
    pub fn parse(record: &RelayRecord) -> Result<Self> {
        let cmd = record
            .get("cmd")
            .and_then(Value::as_str)
            .ok_or_else(|| RtError::protocol("missing cmd"))?;
        let args = Value::Object(record.clone());
        match cmd {
            "init" => {
                let args: InitArgs = serde_json::from_value(args)
                    .map_err(|e| RtError::protocol(format!("bad init request: {}", e)))?;
                match (args.img_dir, args.file_pattern, args.min_file_size) {
                    (Some(dir), Some(pattern), Some(min_file_size)) => Ok(Self::Init {
                        dir,
                        pattern,
                        min_file_size,
                    }),
                    _ => Err(RtError::protocol("missing file information")),
                }
            }
            "get" => {
                let args: GetArgs = serde_json::from_value(args)
                    .map_err(|e| RtError::protocol(format!("bad get request: {}", e)))?;
                let filename = args
                    .filename
                    .ok_or_else(|| RtError::protocol("missing filename"))?;
                Ok(Self::Get { filename })
            }
            "ping" => Ok(Self::Ping),
            other => Err(RtError::protocol(format!("Unrecognized command '{}'", other))),
        }
    }

    pub fn init(dir: &str, pattern: &str, min_file_size: u64) -> RelayRecord {
        let mut record = command("init");
        record.insert("imgDir".to_string(), Value::from(dir));
        record.insert("filePattern".to_string(), Value::from(pattern));
        record.insert("minFileSize".to_string(), Value::from(min_file_size));
        record
    }

    pub fn get(filename: &str) -> RelayRecord {
        let mut record = command("get");
        record.insert("filename".to_string(), Value::from(filename));
        record
    }

    pub fn ping() -> RelayRecord {
        command("ping")
    }
}

fn command(cmd: &str) -> RelayRecord {
    let mut record = Map::new();
    record.insert("cmd".to_string(), Value::from(cmd));
    record
}

/// Outcome of one relay request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// File bytes, base64 encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl RelayResponse {
    pub fn ok() -> Self {
        Self {
            status: STATUS_OK,
            error: None,
            data: None,
        }
    }

    pub fn with_file(bytes: &[u8]) -> Self {
        Self {
            data: Some(STANDARD.encode(bytes)),
            ..Self::ok()
        }
    }

    pub fn from_error(error: &RtError) -> Self {
        let status = match error {
            RtError::AccessDenied(_) => STATUS_FORBIDDEN,
            _ => STATUS_BAD_REQUEST,
        };
        let error = match error {
            RtError::Protocol(text) | RtError::Domain(text) | RtError::AccessDenied(text) => {
                text.clone()
            }
            other => other.to_string(),
        };
        Self {
            status,
            error: Some(error),
            data: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }

    pub fn decode_data(&self) -> Result<Vec<u8>> {
        let data = self
            .data
            .as_deref()
            .ok_or_else(|| RtError::protocol("response carries no data"))?;
        STANDARD
            .decode(data)
            .map_err(|e| RtError::protocol(format!("bad file encoding: {}", e)))
    }

    /// Echo the request fields back, with the response's own fields on top.
    /// Request keys that only a response may set are dropped.
    pub fn merge_echo(self, request: &RelayRecord) -> RelayRecord {
        let mut merged = request.clone();
        for key in ["status", "error", "data"] {
            merged.remove(key);
        }
        if let Ok(Value::Object(own)) = serde_json::to_value(&self) {
            merged.extend(own);
        }
        merged
    }

    /// Split a merged record back into the response part.
    pub fn from_record(record: &RelayRecord) -> Result<Self> {
        serde_json::from_value(Value::Object(record.clone()))
            .map_err(|e| RtError::protocol(format!("bad relay response: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> RelayRecord {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn parses_init_with_all_fields() {
        let req = RelayRequest::parse(&RelayRequest::init("/tmp", "*.dcm", 1024)).unwrap();
        assert_eq!(
            req,
            RelayRequest::Init {
                dir: "/tmp".to_string(),
                pattern: "*.dcm".to_string(),
                min_file_size: 1024
            }
        );
    }

    #[test]
    fn init_with_null_field_is_rejected() {
        let rec = record(json!({"cmd": "init", "imgDir": "/tmp", "filePattern": null, "minFileSize": 0}));
        let err = RelayRequest::parse(&rec).unwrap_err();
        assert!(err.to_string().contains("missing file information"));
    }

    #[test]
    fn get_without_filename_is_rejected() {
        let rec = record(json!({"cmd": "get"}));
        assert!(matches!(
            RelayRequest::parse(&rec),
            Err(RtError::Protocol(_))
        ));
    }

    #[test]
    fn unknown_command_is_rejected() {
        let rec = record(json!({"cmd": "delete"}));
        let err = RelayRequest::parse(&rec).unwrap_err();
        assert!(err.to_string().contains("Unrecognized command"));
    }

    #[test]
    fn response_echoes_request_fields() {
        let request = record(json!({"cmd": "ping", "reqId": 7, "status": "ignored"}));
        let merged = RelayResponse::ok().merge_echo(&request);
        assert_eq!(merged["cmd"], "ping");
        assert_eq!(merged["reqId"], 7);
        assert_eq!(merged["status"], 200);
    }

    #[test]
    fn request_cannot_supply_error_or_data() {
        let request = record(json!({
            "cmd": "ping",
            "reqId": 8,
            "error": "forged",
            "data": "Zm9yZ2Vk"
        }));
        let merged = RelayResponse::ok().merge_echo(&request);
        assert!(!merged.contains_key("error"));
        assert!(!merged.contains_key("data"));

        let resp = RelayResponse::from_record(&merged).unwrap();
        assert_eq!(resp.error, None);
        assert!(resp.decode_data().is_err());
    }

    #[test]
    fn access_denied_maps_to_forbidden() {
        let resp = RelayResponse::from_error(&RtError::access_denied("nope"));
        assert_eq!(resp.status, STATUS_FORBIDDEN);
        assert_eq!(resp.error.as_deref(), Some("nope"));

        let resp = RelayResponse::from_error(&RtError::protocol("missing filename"));
        assert_eq!(resp.status, STATUS_BAD_REQUEST);
    }

    #[test]
    fn file_bytes_survive_encoding() {
        let resp = RelayResponse::with_file(&[0, 159, 146, 150]);
        let merged = resp.merge_echo(&RelayRequest::get("/tmp/a.dcm"));
        let back = RelayResponse::from_record(&merged).unwrap();
        assert_eq!(back.decode_data().unwrap(), vec![0, 159, 146, 150]);
    }
}

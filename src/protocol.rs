//! Line-delimited JSON control protocol spoken between the supervisor and a child.
//!
//! Every message is one UTF-8 JSON object on a single line:
//! `{"method": ..., "correlationId": ..., "params": {...}}`. Receivers are
//! responsible for buffering partial reads until a full line is available.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Child → supervisor handshake carrying the correlation id.
pub const METHOD_PROC_ID_INFO: &str = "proc-id-info";
/// Supervisor → child permission to start emitting stdio.
pub const METHOD_PROLOGUE_CONTINUE: &str = "prologue-continue";
/// Child → supervisor final exit code.
pub const METHOD_EPILOGUE_EXIT_CODE: &str = "epilogue-exit-code";
/// Supervisor → child acknowledgement that the child may terminate.
pub const METHOD_EPILOGUE_EXIT: &str = "epilogue-exit";
/// Child → supervisor stdout chunk.
pub const METHOD_STDOUT: &str = "stdout";
/// Child → supervisor stderr chunk.
pub const METHOD_STDERR: &str = "stderr";
/// Input request (child → supervisor) or collected input (supervisor → child).
pub const METHOD_STDIN: &str = "stdin";

/// A decoded control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    /// Protocol method name.
    pub method: String,
    /// Correlation id of the launch this message belongs to.
    pub correlation_id: String,
    /// Method-specific parameters; an empty object when the method has none.
    #[serde(default = "empty_params", deserialize_with = "params_or_empty")]
    pub params: Map<String, Value>,
}

fn empty_params() -> Map<String, Value> {
    Map::new()
}

fn params_or_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<Map<String, Value>>::deserialize(deserializer).map(Option::unwrap_or_default)
}

impl ControlMessage {
    /// Build a message from its parts.
    pub fn new(method: &str, correlation_id: &str, params: Map<String, Value>) -> Self {
        Self {
            method: method.to_string(),
            correlation_id: correlation_id.to_string(),
            params,
        }
    }

    /// Read a string parameter.
    pub fn str_param(&self, key: &'static str) -> Result<&str, ProtocolError> {
        self.params
            .get(key)
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingParam {
                method: self.method.clone(),
                key,
            })
    }

    /// Read an integer parameter.
    pub fn int_param(&self, key: &'static str) -> Result<i64, ProtocolError> {
        self.params
            .get(key)
            .and_then(Value::as_i64)
            .ok_or(ProtocolError::MissingParam {
                method: self.method.clone(),
                key,
            })
    }

    /// Read a boolean parameter; integer 0/1 is accepted as well.
    pub fn bool_param(&self, key: &'static str) -> Result<bool, ProtocolError> {
        match self.params.get(key) {
            Some(Value::Bool(flag)) => Ok(*flag),
            Some(Value::Number(number)) if number.as_i64().is_some() => {
                Ok(number.as_i64() != Some(0))
            }
            _ => Err(ProtocolError::MissingParam {
                method: self.method.clone(),
                key,
            }),
        }
    }
}

/// Failure to decode a control line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The line is not a JSON object.
    Malformed(String),
    /// A required top-level field is absent or has the wrong type.
    MissingField(&'static str),
    /// A method-specific parameter is absent or has the wrong type.
    MissingParam {
        /// Method whose params were inspected.
        method: String,
        /// Missing key.
        key: &'static str,
    },
    /// A parameter is present but its value is not acceptable.
    InvalidParam {
        /// Method whose params were inspected.
        method: String,
        /// Offending key.
        key: &'static str,
    },
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(err) => write!(f, "malformed control message: {err}"),
            Self::MissingField(field) => write!(f, "control message missing `{field}`"),
            Self::MissingParam { method, key } => {
                write!(f, "`{method}` message missing param `{key}`")
            }
            Self::InvalidParam { method, key } => {
                write!(f, "`{method}` message has an invalid `{key}`")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Encode one message as a single newline-terminated line.
pub fn encode(method: &str, correlation_id: &str, params: Map<String, Value>) -> String {
    encode_message(&ControlMessage::new(method, correlation_id, params))
}

/// Encode an already-built message as a newline-terminated line.
pub fn encode_message(message: &ControlMessage) -> String {
    // serde_json escapes control characters inside strings, so the body never
    // contains a raw newline.
    let mut line = serde_json::to_string(message).unwrap_or_else(|_| {
        format!(
            "{{\"method\":{},\"correlationId\":{},\"params\":{{}}}}",
            Value::String(message.method.clone()),
            Value::String(message.correlation_id.clone())
        )
    });
    line.push('\n');
    line
}

/// Decode one line (trailing `\r\n`/`\n` tolerated).
pub fn decode(line: &str) -> Result<ControlMessage, ProtocolError> {
    let trimmed = line.trim_end_matches(['\n', '\r']);
    let value: Value =
        serde_json::from_str(trimmed).map_err(|err| ProtocolError::Malformed(err.to_string()))?;
    let Value::Object(mut object) = value else {
        return Err(ProtocolError::Malformed("expected a JSON object".to_string()));
    };
    let method = match object.remove("method") {
        Some(Value::String(method)) => method,
        _ => return Err(ProtocolError::MissingField("method")),
    };
    let correlation_id = match object.remove("correlationId") {
        Some(Value::String(id)) => id,
        _ => return Err(ProtocolError::MissingField("correlationId")),
    };
    let params = match object.remove("params") {
        Some(Value::Object(params)) => params,
        None | Some(Value::Null) => Map::new(),
        Some(_) => return Err(ProtocolError::Malformed("params must be an object".to_string())),
    };
    Ok(ControlMessage {
        method,
        correlation_id,
        params,
    })
}

/// Build a params map from key/value pairs.
pub fn params<const N: usize>(pairs: [(&str, Value); N]) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

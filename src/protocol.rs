//! Messages exchanged over the command channel.
//!
//! Every frame payload is one JSON document. The tool sends a [`Request`];
//! the engine answers each request with exactly one [`Response`].
//!
//! ```json
//! {"kind":"execute","script":"print(json.encode(editor.list_assets('/Game/')))"}
//! {"kind":"result","stdout":"[...]\n","stderr":"","succeeded":true}
//! ```

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// A command sent from the tool to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    /// Run a script in the engine's persistent scripting session.
    Execute { script: String },
    /// Stop the engine's command server.
    Shutdown,
}

/// The engine's answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    Result(ExecutionResult),
    ShuttingDown,
}

/// Everything a script produced during one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub succeeded: bool,
}

impl ExecutionResult {
    pub fn success(stdout: String) -> Self {
        Self {
            stdout,
            stderr: String::new(),
            succeeded: true,
        }
    }

    pub fn failure(stdout: String, stderr: String) -> Self {
        Self {
            stdout,
            stderr,
            succeeded: false,
        }
    }

    /// Decode the last non-empty stdout line as JSON.
    ///
    /// Query scripts print their structured result last, so any earlier
    /// `print` output is ignored. A failed execution surfaces as
    /// [`Error::ScriptExecution`].
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T> {
        if !self.succeeded {
            return Err(Error::script(self.stderr.trim()));
        }
        let line = self
            .stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| Error::protocol("script produced no output"))?;
        serde_json::from_str(line)
            .map_err(|e| Error::protocol(format!("unexpected script output: {}", e)))
    }
}

impl Request {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::protocol(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::protocol(format!("bad request: {}", e)))
    }
}

impl Response {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::protocol(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::protocol(format!("bad response: {}", e)))
    }
}

/// Deserialize a script-produced tag table into an ordered string map.
///
/// Lua encodes an empty table as `{}` or `[]` depending on how it was built,
/// and tag values may be numbers or booleans; all of them become strings.
pub(crate) fn de_string_map<'de, D>(d: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::Null => Ok(BTreeMap::new()),
        serde_json::Value::Array(a) if a.is_empty() => Ok(BTreeMap::new()),
        serde_json::Value::Object(map) => Ok(map
            .into_iter()
            .map(|(k, v)| {
                let v = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, v)
            })
            .collect()),
        other => Err(D::Error::custom(format!(
            "expected a tag table, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AssetDescriptor;

    #[test]
    fn request_wire_shape() {
        let req = Request::Execute {
            script: "print(1)".into(),
        };
        let bytes = req.encode().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains(r#""kind":"execute""#));
        assert_eq!(Request::decode(&bytes).unwrap(), req);
        assert_eq!(
            Request::decode(br#"{"kind":"shutdown"}"#).unwrap(),
            Request::Shutdown
        );
    }

    #[test]
    fn response_decodes_flattened_result() {
        let resp =
            Response::decode(br#"{"kind":"result","stdout":"hi\n","stderr":"","succeeded":true}"#)
                .unwrap();
        assert_eq!(
            resp,
            Response::Result(ExecutionResult::success("hi\n".into()))
        );
    }

    #[test]
    fn parse_json_uses_last_line() {
        let r = ExecutionResult::success("loading...\n{\"n\": 3}\n\n".into());
        let v: serde_json::Value = r.parse_json().unwrap();
        assert_eq!(v["n"], 3);
    }

    #[test]
    fn parse_json_on_failure_is_script_error() {
        let r = ExecutionResult::failure(String::new(), "boom".into());
        let err = r.parse_json::<serde_json::Value>().unwrap_err();
        assert!(matches!(err, Error::ScriptExecution { ref stderr } if stderr == "boom"));
    }

    #[test]
    fn parse_json_without_output_is_protocol_error() {
        let r = ExecutionResult::success("\n".into());
        assert!(matches!(
            r.parse_json::<serde_json::Value>(),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn descriptor_tags_accept_lua_shapes() {
        let d: AssetDescriptor = serde_json::from_str(
            r#"{"object_path":"/Game/A.A","class_name":"Texture2D","package_path":"/Game/A","tags":{"Width":512,"sRGB":true,"Group":"World"}}"#,
        )
        .unwrap();
        assert_eq!(d.tags["Width"], "512");
        assert_eq!(d.tags["sRGB"], "true");
        assert_eq!(d.tags["Group"], "World");

        let empty: AssetDescriptor = serde_json::from_str(
            r#"{"object_path":"/Game/B.B","class_name":"Material","tags":[]}"#,
        )
        .unwrap();
        assert!(empty.tags.is_empty());
        assert_eq!(empty.package_path, "");
    }
}

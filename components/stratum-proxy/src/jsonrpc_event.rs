//! Newline-delimited JSON-RPC model shared by the pool and miner sides.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stratum method types seen on either side of the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StratumMethod {
    Subscribe,
    ExtranonceSubscribe,
    Authorize,
    Submit,
    SetDifficulty,
    Notify,
    SetExtranonce,
    ClientReconnect,
    ClientShowMessage,
    ClientGetVersion,
    ClientAddPeers,
    GetHashrate,
    GetTemperature,
    GetTransactions,
    Other(String),
}

impl From<&str> for StratumMethod {
    fn from(s: &str) -> Self {
        match s {
            "mining.subscribe" => StratumMethod::Subscribe,
            "mining.extranonce.subscribe" => StratumMethod::ExtranonceSubscribe,
            "mining.authorize" => StratumMethod::Authorize,
            "mining.submit" => StratumMethod::Submit,
            "mining.set_difficulty" => StratumMethod::SetDifficulty,
            "mining.notify" => StratumMethod::Notify,
            "mining.set_extranonce" => StratumMethod::SetExtranonce,
            "client.reconnect" => StratumMethod::ClientReconnect,
            "client.show_message" => StratumMethod::ClientShowMessage,
            "client.get_version" => StratumMethod::ClientGetVersion,
            "client.add_peers" => StratumMethod::ClientAddPeers,
            "mining.get_hashrate" => StratumMethod::GetHashrate,
            "mining.get_temperature" => StratumMethod::GetTemperature,
            "mining.get_transactions" => StratumMethod::GetTransactions,
            other => StratumMethod::Other(other.to_string()),
        }
    }
}

/// JSON-RPC event (a request or notification).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcEvent {
    /// ID can be null, string, or number; notifications carry null or none.
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl JsonRpcEvent {
    pub fn request(id: u64, method: &str, params: Vec<Value>) -> Self {
        Self { id: Some(Value::Number(id.into())), method: method.to_string(), params }
    }

    pub fn notification(method: &str, params: Vec<Value>) -> Self {
        Self { id: None, method: method.to_string(), params }
    }

    pub fn method_enum(&self) -> StratumMethod {
        StratumMethod::from(self.method.as_str())
    }

    /// Requests expect an answer; notifications don't.
    pub fn is_notification(&self) -> bool {
        matches!(self.id, None | Some(Value::Null))
    }
}

/// JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub id: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self { id, result: Some(result), error: None }
    }

    /// Stratum-style error triple `[code, message, null]`.
    pub fn error(id: Option<Value>, code: i64, message: &str) -> Self {
        Self {
            id,
            result: None,
            error: Some(Value::Array(vec![
                Value::Number(code.into()),
                Value::String(message.to_string()),
                Value::Null,
            ])),
        }
    }

    /// Decode an error value into `(code, message)`, accepting both the
    /// stratum array form and the object form different pools emit.
    pub fn error_parts(&self) -> Option<(i64, String)> {
        let err = self.error.as_ref()?;
        match err {
            Value::Array(items) => {
                let code = items.first().and_then(Value::as_i64).unwrap_or(-1);
                let message = items
                    .get(1)
                    .and_then(Value::as_str)
                    .unwrap_or("remote error")
                    .to_string();
                Some((code, message))
            }
            Value::Object(map) => {
                let code = map.get("code").and_then(Value::as_i64).unwrap_or(-1);
                let message = map
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("remote error")
                    .to_string();
                Some((code, message))
            }
            Value::String(s) => Some((-1, s.clone())),
            Value::Null => None,
            other => Some((-1, other.to_string())),
        }
    }
}

/// Anything a peer can put on one line.
#[derive(Debug, Clone)]
pub enum JsonRpcMessage {
    Event(JsonRpcEvent),
    Response(JsonRpcResponse),
}

/// Unmarshal one line from the wire. Lines with a `method` are events
/// (requests or notifications); everything else must be a response.
pub fn unmarshal_message(input: &str) -> Result<JsonRpcMessage, serde_json::Error> {
    let value: Value = serde_json::from_str(input)?;
    if value.get("method").is_some() {
        serde_json::from_value(value).map(JsonRpcMessage::Event)
    } else {
        serde_json::from_value(value).map(JsonRpcMessage::Response)
    }
}

/// Serialize a wire object to its newline-terminated frame.
pub fn marshal_frame<T: Serialize>(msg: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn method_roundtrip() {
        assert_eq!(StratumMethod::from("mining.notify"), StratumMethod::Notify);
        assert_eq!(StratumMethod::from("client.reconnect"), StratumMethod::ClientReconnect);
        assert_eq!(
            StratumMethod::from("mining.ping"),
            StratumMethod::Other("mining.ping".to_string())
        );
    }

    #[test]
    fn unmarshal_discriminates_events_and_responses() {
        let event = unmarshal_message(r#"{"id":null,"method":"mining.notify","params":[]}"#).unwrap();
        assert!(matches!(event, JsonRpcMessage::Event(e) if e.is_notification()));

        let request = unmarshal_message(r#"{"id":7,"method":"client.get_version","params":[]}"#).unwrap();
        match request {
            JsonRpcMessage::Event(e) => assert!(!e.is_notification()),
            other => panic!("expected event, got {other:?}"),
        }

        let response = unmarshal_message(r#"{"id":1,"result":true,"error":null}"#).unwrap();
        match response {
            JsonRpcMessage::Response(r) => {
                assert_eq!(r.result, Some(json!(true)));
                assert!(r.error_parts().is_none());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn error_parts_accepts_all_pool_dialects() {
        let array = JsonRpcResponse {
            id: None,
            result: None,
            error: Some(json!([23, "low difficulty", null])),
        };
        assert_eq!(array.error_parts(), Some((23, "low difficulty".to_string())));

        let object = JsonRpcResponse {
            id: None,
            result: None,
            error: Some(json!({"code": -2, "message": "stale"})),
        };
        assert_eq!(object.error_parts(), Some((-2, "stale".to_string())));

        let string = JsonRpcResponse { id: None, result: None, error: Some(json!("nope")) };
        assert_eq!(string.error_parts(), Some((-1, "nope".to_string())));
    }

    #[test]
    fn frames_end_with_newline() {
        let frame = marshal_frame(&JsonRpcEvent::request(1, "mining.subscribe", vec![])).unwrap();
        assert!(frame.ends_with('\n'));
        assert!(!frame[..frame.len() - 1].contains('\n'));
    }
}

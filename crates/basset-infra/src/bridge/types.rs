//! Bridge wire types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Command types understood by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Navigate,
    FillForm,
    Click,
    GetContent,
    Screenshot,
    WaitForElement,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Navigate => "navigate",
            CommandType::FillForm => "fill_form",
            CommandType::Click => "click",
            CommandType::GetContent => "get_content",
            CommandType::Screenshot => "screenshot",
            CommandType::WaitForElement => "wait_for_element",
        }
    }
}

/// Request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeCommand {
    pub command_id: Uuid,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    pub params: Value,
}

/// Response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeResponse {
    pub command_id: Uuid,
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_wire_shape() {
        let id = Uuid::now_v7();
        let cmd = BridgeCommand {
            command_id: id,
            command_type: CommandType::WaitForElement,
            params: json!({"selector": "#login"}),
        };
        let wire = serde_json::to_value(&cmd).unwrap();
        assert_eq!(wire["type"], "wait_for_element");
        assert_eq!(wire["command_id"], json!(id));
        assert_eq!(wire["params"]["selector"], "#login");
    }

    #[test]
    fn test_response_without_optional_fields() {
        let id = Uuid::now_v7();
        let resp: BridgeResponse =
            serde_json::from_value(json!({"command_id": id, "success": true})).unwrap();
        assert!(resp.result.is_none());
        assert!(resp.error.is_none());
    }
}

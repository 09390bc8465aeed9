use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wildcard subscription for device-to-server telemetry.
pub(crate) const SHADOW_UPDATE_FILTER: &str = "things/+/shadow/update";

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

/// Inbound shadow update. Thingy firmware sends `data` as a string for most
/// apps ("23.5", "10 20 30 40"), but numbers are accepted too.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ThingyMessage {
    #[serde(rename = "appId")]
    pub(crate) app_id: Option<String>,
    #[serde(default)]
    pub(crate) data: Value,
}

impl ThingyMessage {
    /// Button pressed (not released).
    pub(crate) fn is_button_press(&self) -> bool {
        self.app_id.as_deref() == Some("BUTTON")
            && match &self.data {
                Value::String(s) => s == "1",
                Value::Number(n) => n.as_i64() == Some(1),
                _ => false,
            }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct LedCommand<'a> {
    #[serde(rename = "appId")]
    pub(crate) app_id: &'static str,
    pub(crate) data: LedColor<'a>,
    #[serde(rename = "messageType")]
    pub(crate) message_type: &'static str,
}

#[derive(Debug, Serialize)]
pub(crate) struct LedColor<'a> {
    pub(crate) color: &'a str,
}

impl<'a> LedCommand<'a> {
    pub(crate) fn new(color: &'a str) -> Self {
        Self {
            app_id: "LED",
            data: LedColor { color },
            message_type: "CFG_SET",
        }
    }
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Extract thingy_id from "things/<thingy_id>/shadow/update".
pub(crate) fn extract_thingy_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 4
        && parts[0] == "things"
        && is_valid_thingy_id(parts[1])
        && parts[2] == "shadow"
        && parts[3] == "update"
    {
        Some(parts[1])
    } else {
        None
    }
}

/// Ids name a directory under the backup root, so they must stay a single
/// plain path component.
pub(crate) fn is_valid_thingy_id(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.contains(['/', '\\', '\0'])
}

/// Command topic the thingy listens on.
pub(crate) fn command_topic(thingy_id: &str) -> String {
    format!("things/{thingy_id}/shadow/update/accepted")
}

pub(crate) fn parse_message(payload: &[u8]) -> Result<ThingyMessage, serde_json::Error> {
    serde_json::from_slice(payload)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- extract_thingy_id --------------------------------------------------

    #[test]
    fn extract_thingy_id_valid_topic() {
        assert_eq!(extract_thingy_id("things/orange-1/shadow/update"), Some("orange-1"));
    }

    #[test]
    fn extract_thingy_id_wrong_prefix() {
        assert_eq!(extract_thingy_id("tele/orange-1/shadow/update"), None);
    }

    #[test]
    fn extract_thingy_id_accepted_topic_is_not_telemetry() {
        assert_eq!(extract_thingy_id("things/orange-1/shadow/update/accepted"), None);
    }

    #[test]
    fn extract_thingy_id_empty_segment() {
        assert_eq!(extract_thingy_id("things//shadow/update"), None);
    }

    #[test]
    fn extract_thingy_id_rejects_path_components() {
        for topic in [
            "things/../shadow/update",
            "things/./shadow/update",
            "things/a\\b/shadow/update",
        ] {
            assert_eq!(extract_thingy_id(topic), None, "{topic}");
        }
        assert_eq!(extract_thingy_id("things/..orange/shadow/update"), Some("..orange"));
    }

    #[test]
    fn extract_thingy_id_empty_string() {
        assert_eq!(extract_thingy_id(""), None);
    }

    #[test]
    fn command_topic_shape() {
        assert_eq!(command_topic("orange-2"), "things/orange-2/shadow/update/accepted");
    }

    // -- ThingyMessage ------------------------------------------------------

    #[test]
    fn parse_scalar_message() {
        let msg = parse_message(br#"{"appId":"TEMP","data":"23.5","messageType":"DATA"}"#).unwrap();
        assert_eq!(msg.app_id.as_deref(), Some("TEMP"));
        assert_eq!(msg.data, Value::String("23.5".into()));
    }

    #[test]
    fn parse_message_without_app_id() {
        let msg = parse_message(br#"{"data":"x"}"#).unwrap();
        assert!(msg.app_id.is_none());
    }

    #[test]
    fn parse_garbage_fails() {
        assert!(parse_message(b"not json").is_err());
    }

    #[test]
    fn button_press_detection() {
        assert!(parse_message(br#"{"appId":"BUTTON","data":"1"}"#).unwrap().is_button_press());
        assert!(parse_message(br#"{"appId":"BUTTON","data":1}"#).unwrap().is_button_press());
        assert!(!parse_message(br#"{"appId":"BUTTON","data":"0"}"#).unwrap().is_button_press());
        assert!(!parse_message(br#"{"appId":"TEMP","data":"1"}"#).unwrap().is_button_press());
    }

    // -- LedCommand ---------------------------------------------------------

    #[test]
    fn led_command_envelope() {
        let json = serde_json::to_value(LedCommand::new("FFA500")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "appId": "LED",
                "data": { "color": "FFA500" },
                "messageType": "CFG_SET"
            })
        );
    }
}

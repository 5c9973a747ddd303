use thiserror::Error;

use crate::{
    scan::{bare_token, scan_token, scan_uint},
    topics::{CONFIG_SUFFIX, CONTROL_SUFFIX},
};

/// A decoded inbound command, consumed once by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Reconfigure {
        interval: u64,
        duration: u64,
        turn_on_at: Option<u64>,
    },
    SetOutput {
        on: bool,
    },
}

/// Why a payload produced no command. Rejections are diagnostics only;
/// the dispatcher logs them and mutates nothing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("config payload has missing or zero `{0}`")]
    InvalidField(&'static str),
    #[error("unrecognized control value `{0}`")]
    UnknownControlValue(String),
    #[error("no commands carried on topic `{0}`")]
    UnhandledTopic(String),
}

/// Decode a raw payload received on `topic` into a [`Command`].
///
/// The payload is treated as loosely delimited `key:value` text, not a
/// strict grammar; unknown fields and field order are ignored.
pub fn decode(topic: &str, payload: &str) -> Result<Command, DecodeError> {
    if topic.ends_with(CONFIG_SUFFIX) {
        decode_config(payload)
    } else if topic.ends_with(CONTROL_SUFFIX) {
        decode_control(payload)
    } else {
        Err(DecodeError::UnhandledTopic(topic.to_string()))
    }
}

// Example payload: {"interval":3600,"duration":30,"TURN_ON_AT":1772431200}
fn decode_config(payload: &str) -> Result<Command, DecodeError> {
    let interval = scan_uint(payload, "interval").unwrap_or(0);
    let duration = scan_uint(payload, "duration").unwrap_or(0);

    if interval == 0 {
        return Err(DecodeError::InvalidField("interval"));
    }
    if duration == 0 {
        return Err(DecodeError::InvalidField("duration"));
    }

    let turn_on_at = scan_uint(payload, "TURN_ON_AT").filter(|&epoch| epoch > 0);

    Ok(Command::Reconfigure {
        interval,
        duration,
        turn_on_at,
    })
}

// Payload is either a bareword (`ON` / `OFF`) or key:value text such as
// {"output":"ON"} whose value may be quoted.
fn decode_control(payload: &str) -> Result<Command, DecodeError> {
    let token = scan_token(payload, "output").unwrap_or_else(|| bare_token(payload));

    let value = token.to_ascii_uppercase();
    match value.as_str() {
        "ON" => Ok(Command::SetOutput { on: true }),
        "OFF" => Ok(Command::SetOutput { on: false }),
        _ => Err(DecodeError::UnknownControlValue(value)),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::topics::{TOPIC_CONFIG, TOPIC_CONTROL};

    #[test]
    fn config_payload_decodes_to_reconfigure() {
        let command = decode(TOPIC_CONFIG, r#"{"interval":3600,"duration":30}"#);

        assert_eq!(
            command,
            Ok(Command::Reconfigure {
                interval: 3_600,
                duration: 30,
                turn_on_at: None,
            })
        );
    }

    #[test]
    fn config_with_explicit_turn_on_epoch() {
        let command = decode(
            TOPIC_CONFIG,
            r#"{"TURN_ON_AT":1708532400,"interval":3600,"duration":30}"#,
        );

        assert_eq!(
            command,
            Ok(Command::Reconfigure {
                interval: 3_600,
                duration: 30,
                turn_on_at: Some(1_708_532_400),
            })
        );
    }

    #[test]
    fn zero_or_missing_required_fields_reject() {
        assert_eq!(
            decode(TOPIC_CONFIG, r#"{"interval":0,"duration":30}"#),
            Err(DecodeError::InvalidField("interval"))
        );
        assert_eq!(
            decode(TOPIC_CONFIG, r#"{"interval":3600}"#),
            Err(DecodeError::InvalidField("duration"))
        );
    }

    #[test]
    fn control_accepts_barewords_case_insensitively() {
        assert_eq!(
            decode(TOPIC_CONTROL, "ON"),
            Ok(Command::SetOutput { on: true })
        );
        assert_eq!(
            decode(TOPIC_CONTROL, "off"),
            Ok(Command::SetOutput { on: false })
        );
    }

    #[test]
    fn control_accepts_quoted_output_field() {
        assert_eq!(
            decode(TOPIC_CONTROL, r#"{"output":"off"}"#),
            Ok(Command::SetOutput { on: false })
        );
        assert_eq!(
            decode(TOPIC_CONTROL, "{'output': 'ON', 'zone': 1}"),
            Ok(Command::SetOutput { on: true })
        );
    }

    #[test]
    fn unknown_control_value_rejects() {
        assert_eq!(
            decode(TOPIC_CONTROL, "TOGGLE"),
            Err(DecodeError::UnknownControlValue("TOGGLE".to_string()))
        );
    }

    #[test]
    fn unrelated_topic_is_unhandled() {
        assert_eq!(
            decode("irrigator/heartbeat", "alive"),
            Err(DecodeError::UnhandledTopic("irrigator/heartbeat".to_string()))
        );
    }
}

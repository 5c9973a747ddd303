use serde::{Deserialize, Serialize};

/// Commanded state of the single controlled output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutputState {
    Off,
    On,
}

impl OutputState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::On => "ON",
        }
    }

    pub fn from_bool(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }
}

/// Connectivity phases the status indicator distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    NetworkConnecting,
    NetworkUp,
    BrokerConnecting,
    BrokerConnected,
    NetworkFailed,
    BrokerFailed,
}

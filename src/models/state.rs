use serde::{Deserialize, Serialize};

/// The device's emotional state. SAD is the rest state; GLAD is entered when
/// enough touches land within the configured rolling window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum EmotionalState {
    Sad,
    Glad,
}

impl EmotionalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmotionalState::Sad => "sad",
            EmotionalState::Glad => "glad",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "sad" => Some(EmotionalState::Sad),
            "glad" => Some(EmotionalState::Glad),
            _ => None,
        }
    }
}

impl Default for EmotionalState {
    fn default() -> Self {
        EmotionalState::Sad
    }
}

/// Seconds spent in each state during one calendar day.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StateDurations {
    pub sad_secs: u64,
    pub glad_secs: u64,
}

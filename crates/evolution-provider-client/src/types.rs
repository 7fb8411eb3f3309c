//! Values returned by provider operations.

use serde::{Deserialize, Serialize};

/// Outcome of a successful create-or-recover call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionCreated {
    /// The provider session was deleted and created again.
    pub recreated: bool,
    /// An existing provider session was adopted as-is.
    pub recovered: bool,
}

/// Pairing payload shown to the end user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingCode {
    /// Opaque code string. When the provider only returns an image this
    /// holds the image payload.
    pub code: String,
    /// Base64 image rendering of the code, when provided.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Result of a callback registration request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackRegistration {
    Registered,
    Rejected(String),
}

/// Callback configuration as the provider reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackStatus {
    pub url: String,
    pub enabled: bool,
    #[serde(default)]
    pub events: Vec<String>,
}

impl CallbackStatus {
    /// True when the registration is enabled and points at `expected_url`.
    pub fn matches(&self, expected_url: &str) -> bool {
        self.enabled && self.url.trim_end_matches('/') == expected_url.trim_end_matches('/')
    }
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid runtime '{0}': must be either \"cloud\" or \"sdk\"")]
    InvalidRuntime(String),

    #[error("Config file error: {0}")]
    ConfigFile(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure talking to the remote trace store. Never reaches the traced workflow.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Server error: {status} - {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode payload: {0}")]
    Decode(String),

    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Component '{component}' failed: {message}")]
pub struct ComponentError {
    pub component: String,
    pub message: String,
}

impl ComponentError {
    pub fn new(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            message: message.into(),
        }
    }
}

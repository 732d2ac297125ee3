use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("Missing required property {property} on processor {processor}")]
    MissingProperty { processor: String, property: String },

    #[error("Invalid value for property {property}: {message}")]
    InvalidProperty { property: String, message: String },

    // Graph errors
    #[error("Processor not found: {0}")]
    UnknownProcessor(String),

    #[error("Connection not found: {0}")]
    UnknownConnection(String),

    #[error("Relationship {relationship} is not declared by processor {processor}")]
    UnknownRelationship {
        processor: String,
        relationship: String,
    },

    #[error("Relationship {relationship} of processor {processor} has no connection and is not auto-terminated")]
    UnroutedRelationship {
        processor: String,
        relationship: String,
    },

    // Session errors
    #[error("Record not found in session: {0}")]
    UnknownRecord(String),

    #[error("Session already closed")]
    SessionClosed,

    // Content errors
    #[error("Content error: {0}")]
    Content(String),

    #[error("Record {0} has no content claim")]
    ClaimMissing(String),

    // Provenance / storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Provenance error: {0}")]
    Provenance(String),

    // Processor errors
    #[error("Processor {processor} failed: {message}")]
    Processor { processor: String, message: String },

    // Engine errors
    #[error("Engine error: {0}")]
    Engine(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Convenience constructor used by processors reporting their own failures.
    pub fn processor(processor: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Processor {
            processor: processor.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;

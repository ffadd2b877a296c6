use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimError {
    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Unknown node kind for id {0}: {1}")]
    UnknownNodeKind(String, String),

    #[error("Relationship references missing node: {side} '{id}'")]
    MissingReferent { side: &'static str, id: String },

    #[error("Trait {trait_id} references unknown layer {layer_id}")]
    UnknownLayer { trait_id: String, layer_id: String },

    #[error("Formula for '{node}' failed to parse: {message}")]
    FormulaParse { node: String, message: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No configuration loaded")]
    NoConfig,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, SimError>;

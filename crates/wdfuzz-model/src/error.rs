#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// Transition requested to a state the model does not know, with creation disabled.
    #[error("Unknown state: {0}")]
    UnknownState(String),

    #[error("Filter failed to compile: \"{expr}\" ({reason})")]
    FilterCompile { expr: String, reason: String },

    #[error("Field not found: {name}")]
    FieldResolve { name: String },

    #[error("Model export failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

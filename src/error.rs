use thiserror::Error;

#[derive(Error, Debug)]
pub enum AskdbError {
    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Schema extraction error: {0}")]
    SchemaExtraction(String),

    #[error("Unsafe SQL rejected: {0}")]
    UnsafeSql(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("No active database connection for user '{0}'")]
    NoActiveConnection(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Unknown connection id: {0}")]
    UnknownConnection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AskdbError>;

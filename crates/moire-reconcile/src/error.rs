use serde_json::Value;

/// Failure of one logical query. Never retried by this crate.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },

    /// The collaborator answered with a non-success status.
    #[error("{message}")]
    Status { status: u16, message: String },

    #[error("unexpected query response: {0}")]
    Decode(String),

    /// The query was refused before it ran (empty, multiple statements).
    #[error("{0}")]
    Rejected(String),

    /// The executor stopped early (row cap or deadline), so the rows are
    /// a prefix of the real answer.
    #[error("query result truncated after {rows} rows")]
    Truncated { rows: usize },

    #[error("sqlite: {0}")]
    Backend(#[from] rusqlite::Error),

    #[error("query worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl QueryError {
    pub fn from_status(status: u16, body: &str) -> Self {
        QueryError::Status {
            status,
            message: error_message_from_body(status, body),
        }
    }
}

/// Human-readable message for a failed response: the body's `error` field
/// when it has one, else `HTTP <status>`.
pub fn error_message_from_body(status: u16, body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("error")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|message| !message.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| format!("HTTP {status}"))
}

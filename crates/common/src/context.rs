use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Correlation context threaded through async call trees.
///
/// One context is created at the root of a call and cloned into every
/// component it touches, so all log records of that call share the same
/// `correlation_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogContext {
    /// Unique id shared by every log record of one call tree
    pub correlation_id: String,
    /// When the context was created (UTC)
    pub created_at: DateTime<Utc>,
    /// Model the protected operation targets, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Provider serving the operation, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Session the call belongs to, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl LogContext {
    pub fn new() -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            model: None,
            provider: None,
            session_id: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

impl Default for LogContext {
    fn default() -> Self {
        Self::new()
    }
}

use thiserror::Error;

use crate::i18n::I18n;

/// Main service error type
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Authentication failed: {message}")]
    Auth { message: String },

    #[error("Connection is not authenticated")]
    Unauthenticated,

    #[error("Operation requires GM privileges: {action}")]
    Forbidden { action: String },

    #[error("Unknown operation: {operation}")]
    UnknownOperation { operation: String },

    #[error("Unknown tool: {tool}")]
    UnknownTool { tool: String },

    #[error("No client connected for world {world_id}")]
    NoClientConnected { world_id: String },

    #[error("Tool '{tool}' timed out after {seconds} seconds")]
    ToolTimeout { tool: String, seconds: u64 },

    #[error("Tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool loop exceeded {rounds} rounds without a final answer")]
    ToolLoopExhausted { rounds: u32 },

    #[error("Batch not found: {batch_id}")]
    BatchNotFound { batch_id: String },

    #[error("Invalid batch transition for {batch_id}: {from} -> {to}")]
    InvalidBatchTransition {
        batch_id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("Conversation not found: {conversation_id}")]
    ConversationNotFound { conversation_id: String },

    #[error("Canon entry not found: {entry_id}")]
    CanonEntryNotFound { entry_id: String },

    #[error("{0}")]
    Provider(#[from] ProviderError),

    #[error("Database error")]
    Database(#[from] DatabaseError),

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// LLM provider errors
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Connection failed to LLM provider at {url}")]
    Connection {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("LLM request failed (status {status}): {message}")]
    Request { status: u16, message: String },

    #[error("Invalid response from LLM provider")]
    InvalidResponse {
        #[source]
        source: serde_json::Error,
    },

    #[error("No API key configured for world {world_id}")]
    MissingCredential { world_id: String },
}

/// Database errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed")]
    Connection(#[source] rusqlite::Error),

    #[error("Query failed")]
    Query(#[source] rusqlite::Error),

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Serialization failed")]
    Serialization(#[source] serde_json::Error),
}

impl ServiceError {
    /// Stable machine-readable code sent alongside error frames
    pub fn error_code(&self) -> &'static str {
        match self {
            ServiceError::Auth { .. } => "auth_error",
            ServiceError::Unauthenticated => "unauthenticated",
            ServiceError::Forbidden { .. } => "forbidden",
            ServiceError::UnknownOperation { .. } => "unknown_operation",
            ServiceError::UnknownTool { .. } => "unknown_tool",
            ServiceError::NoClientConnected { .. } => "no_client_connected",
            ServiceError::ToolTimeout { .. } => "tool_timeout",
            ServiceError::ToolExecution { .. } => "tool_execution",
            ServiceError::ToolLoopExhausted { .. } => "tool_loop_exhausted",
            ServiceError::BatchNotFound { .. } => "batch_not_found",
            ServiceError::InvalidBatchTransition { .. } => "invalid_batch_transition",
            ServiceError::ConversationNotFound { .. } => "conversation_not_found",
            ServiceError::CanonEntryNotFound { .. } => "canon_entry_not_found",
            ServiceError::Provider(ProviderError::MissingCredential { .. }) => "missing_credential",
            ServiceError::Provider(_) => "provider_error",
            ServiceError::Database(_) => "database_error",
            ServiceError::InvalidRequest { .. } => "invalid_request",
            ServiceError::Config { .. } => "config_error",
            ServiceError::Internal { .. } => "internal_error",
        }
    }

    /// Get a user-friendly translated message
    pub fn user_message(&self, i18n: &I18n, locale: &str) -> String {
        match self {
            ServiceError::Unauthenticated => i18n.get(locale, "error-unauthenticated", None),
            ServiceError::Forbidden { action } => {
                i18n.format(locale, "error-forbidden", &[("action", action)])
            }
            ServiceError::NoClientConnected { world_id } => {
                i18n.format(locale, "error-no-client", &[("world", world_id)])
            }
            ServiceError::BatchNotFound { batch_id } => {
                i18n.format(locale, "error-batch-not-found", &[("id", batch_id)])
            }
            ServiceError::ConversationNotFound { conversation_id } => i18n.format(
                locale,
                "error-conversation-not-found",
                &[("id", conversation_id)],
            ),
            ServiceError::Database(_) | ServiceError::Internal { .. } => {
                i18n.get(locale, "error-internal", None)
            }
            // For other errors, fall back to the technical message
            _ => self.to_string(),
        }
    }
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

//! Structured error kinds shared across the connection graph.

/// Result alias used by every public operation in the connection graph.
pub type Result<T> = std::result::Result<T, McmError>;

/// Structured error kind shared across the connection graph. The
/// `context` field carries a short static tag (operation name, component)
/// for log correlation without allocating.
#[derive(Debug, thiserror::Error)]
pub enum McmError {
    #[error("bad argument in {context}")]
    BadArgument {
        context: &'static str,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("wrong state in {context}: {detail}")]
    WrongState {
        context: &'static str,
        detail: String,
    },

    #[error("out of memory in {context}")]
    OutOfMemory { context: &'static str },

    #[error("initialization failed in {context}")]
    InitializationFailed {
        context: &'static str,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("memory registration failed in {context}")]
    MemoryRegistrationFailed { context: &'static str },

    #[error("thread creation failed in {context}")]
    ThreadCreationFailed {
        context: &'static str,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("{context} already initialized")]
    AlreadyInitialized { context: &'static str },

    #[error("no buffer available in {context}")]
    NoBuffer { context: &'static str },

    #[error("no link assigned in {context}")]
    NoLinkAssigned { context: &'static str },

    #[error("timeout in {context}")]
    Timeout { context: &'static str },

    #[error("context cancelled in {context}")]
    ContextCancelled { context: &'static str },

    #[error("general failure in {context}: {detail}")]
    GeneralFailure {
        context: &'static str,
        detail: String,
    },

    /// Supplemental kind (§11): an operation whose wire protocol is an open
    /// question upstream (e.g. the zero-copy gateway) and is intentionally
    /// unimplemented rather than guessed at.
    #[error("unsupported operation in {context}")]
    Unsupported { context: &'static str },
}

impl McmError {
    pub fn bad_argument(context: &'static str) -> Self {
        Self::BadArgument {
            context,
            source: None,
        }
    }

    pub fn wrong_state(context: &'static str, detail: impl Into<String>) -> Self {
        Self::WrongState {
            context,
            detail: detail.into(),
        }
    }

    pub fn general_failure(context: &'static str, detail: impl Into<String>) -> Self {
        Self::GeneralFailure {
            context,
            detail: detail.into(),
        }
    }

    /// The stable, machine-readable kind name (e.g. for metrics labels).
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::BadArgument { .. } => "error_bad_argument",
            Self::WrongState { .. } => "error_wrong_state",
            Self::OutOfMemory { .. } => "error_out_of_memory",
            Self::InitializationFailed { .. } => "error_initialization_failed",
            Self::MemoryRegistrationFailed { .. } => "error_memory_registration_failed",
            Self::ThreadCreationFailed { .. } => "error_thread_creation_failed",
            Self::AlreadyInitialized { .. } => "error_already_initialized",
            Self::NoBuffer { .. } => "error_no_buffer",
            Self::NoLinkAssigned { .. } => "error_no_link_assigned",
            Self::Timeout { .. } => "error_timeout",
            Self::ContextCancelled { .. } => "error_context_cancelled",
            Self::GeneralFailure { .. } => "error_general_failure",
            Self::Unsupported { .. } => "error_unsupported",
        }
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the strand engine.
//!
//! Every error carries a stable machine-readable code via [`EngineError::error_code`].
//! The taxonomy distinguishes transient infrastructure failures (retried with
//! backoff, see [`EngineError::is_transient`]) from logic errors that must
//! surface, and from idempotent-duplicate conditions that callers treat as
//! "already done".

/// Result type using EngineError.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur during engine operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The KV store could not be reached. Transient; retried with backoff.
    #[error("kv unavailable: {0}")]
    KvUnavailable(String),

    /// A registered script failed with a logic error. Not retriable.
    #[error("script '{script}' failed: {message}")]
    ScriptError {
        /// The script name.
        script: String,
        /// Error detail from the store.
        message: String,
    },

    /// An item with this ID already has a live idempotency record.
    #[error("queue item '{0}' was already enqueued")]
    Duplicate(String),

    /// The lease on an item or pause no longer matches.
    #[error("lease lost for '{0}'")]
    LeaseLost(String),

    /// The pause is already leased by another consumer.
    #[error("pause '{0}' is already leased")]
    AlreadyLeased(String),

    /// No queue item is ready to lease.
    #[error("no queue item ready")]
    NoneReady,

    /// A concurrency limit is at capacity; the item stays queued.
    #[error("concurrency limit reached for key '{0}'")]
    ConcurrencyLimited(String),

    /// A run already exists for this identifier or idempotency key.
    #[error("run '{0}' already exists")]
    RunExists(String),

    /// The step output was already written. The operation is a no-op.
    #[error("step '{step_id}' already exists for run '{run_id}'")]
    StepAlreadyExists {
        /// The run.
        run_id: String,
        /// The step that was already written.
        step_id: String,
    },

    /// The run has reached its configured step count limit. Fatal for the run.
    #[error("run '{run_id}' exceeded the step limit of {limit}")]
    StepLimitExceeded {
        /// The run.
        run_id: String,
        /// The configured limit.
        limit: usize,
    },

    /// The run state has reached its configured byte size limit. Fatal.
    #[error("run '{run_id}' exceeded the state size limit of {limit} bytes")]
    StateSizeLimitExceeded {
        /// The run.
        run_id: String,
        /// The configured limit in bytes.
        limit: usize,
    },

    /// The pause was already consumed by another matcher.
    #[error("pause '{0}' was already consumed")]
    PauseConsumed(String),

    /// No pause exists with this ID.
    #[error("pause '{0}' not found")]
    PauseNotFound(String),

    /// A debounce already exists for this pointer; the caller should update it.
    #[error("a debounce already exists for this function and key")]
    DebounceExists {
        /// ID of the existing debounce.
        existing_id: String,
    },

    /// No debounce exists with this ID.
    #[error("debounce '{0}' not found")]
    DebounceNotFound(String),

    /// The debounce timeout item is executing; updates must retry.
    #[error("debounce '{0}' is in progress")]
    DebounceInProgress(String),

    /// The debounce is being migrated; the caller retries from scratch.
    #[error("debounce '{0}' is migrating")]
    DebounceMigrating(String),

    /// No batch exists with this ID (already flushed or rotated).
    #[error("batch '{0}' not found")]
    BatchNotFound(String),

    /// A rate limit rejected the operation.
    #[error("rate limited for key '{0}'")]
    RateLimited(String),

    /// Input validation failed.
    #[error("validation error for '{field}': {message}")]
    Validation {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// JSON (de)serialization failed.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// SDK dispatch failed in a way that is not retriable.
    #[error("dispatch to '{url}' failed: {message}")]
    Dispatch {
        /// The endpoint URL.
        url: String,
        /// Failure detail.
        message: String,
    },
}

impl EngineError {
    /// Stable machine-readable code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::KvUnavailable(_) => "KV_UNAVAILABLE",
            Self::ScriptError { .. } => "SCRIPT_ERROR",
            Self::Duplicate(_) => "DUPLICATE",
            Self::LeaseLost(_) => "LEASE_LOST",
            Self::AlreadyLeased(_) => "ALREADY_LEASED",
            Self::NoneReady => "NONE_READY",
            Self::ConcurrencyLimited(_) => "CONCURRENCY_LIMITED",
            Self::RunExists(_) => "RUN_EXISTS",
            Self::StepAlreadyExists { .. } => "STEP_ALREADY_EXISTS",
            Self::StepLimitExceeded { .. } => "STEP_LIMIT_EXCEEDED",
            Self::StateSizeLimitExceeded { .. } => "STATE_SIZE_LIMIT_EXCEEDED",
            Self::PauseConsumed(_) => "PAUSE_CONSUMED",
            Self::PauseNotFound(_) => "PAUSE_NOT_FOUND",
            Self::DebounceExists { .. } => "DEBOUNCE_EXISTS",
            Self::DebounceNotFound(_) => "DEBOUNCE_NOT_FOUND",
            Self::DebounceInProgress(_) => "DEBOUNCE_IN_PROGRESS",
            Self::DebounceMigrating(_) => "DEBOUNCE_MIGRATING",
            Self::BatchNotFound(_) => "BATCH_NOT_FOUND",
            Self::RateLimited(_) => "RATE_LIMITED",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Serde(_) => "SERDE_ERROR",
            Self::Dispatch { .. } => "DISPATCH_ERROR",
        }
    }

    /// Whether the operation should be retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::KvUnavailable(_))
    }

    /// Whether this error means "the work was already done" and can be
    /// silently ignored by idempotent callers.
    pub fn is_idempotent_duplicate(&self) -> bool {
        matches!(
            self,
            Self::Duplicate(_) | Self::RunExists(_) | Self::StepAlreadyExists { .. } | Self::PauseConsumed(_)
        )
    }
}

impl From<redis::RedisError> for EngineError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_timeout() || err.is_connection_refusal() || err.is_connection_dropped() {
            EngineError::KvUnavailable(err.to_string())
        } else {
            EngineError::ScriptError {
                script: "<command>".to_string(),
                message: err.to_string(),
            }
        }
    }
}

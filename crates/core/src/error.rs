use thiserror::Error;

/// Errors surfaced by the scheduler and its collaborators.
///
/// Store implementations map their backend failures onto [`JobPersistence`];
/// the dispatcher absorbs those, backs off, and keeps running. Everything
/// else is raised synchronously to the caller.
///
/// [`JobPersistence`]: SchedulerError::JobPersistence
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Invalid argument (empty identity, bad interval, unknown zone, …).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Store/add conflict with `replace = false`.
    #[error("{0} already exists")]
    ObjectAlreadyExists(String),

    /// The operation required an identity that is not present.
    #[error("not found: {0}")]
    NotFound(String),

    /// Transient or persistent failure of the backing store.
    #[error("job persistence error: {message}")]
    JobPersistence {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Malformed cron expression in a trigger definition.
    #[error(transparent)]
    CronParse(#[from] belfry_cron::ParseError),

    #[error("unknown timezone: {timezone}")]
    UnknownTimezone { timezone: String },

    #[error("unable to interrupt job: {0}")]
    UnableToInterrupt(String),

    #[error("scheduler configuration error: {0}")]
    Config(String),

    /// The scheduler has been shut down; no further operations are accepted.
    #[error("scheduler has been shutdown")]
    Shutdown,

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("{message}")]
    Message { message: String },
}

impl SchedulerError {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    #[must_use]
    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::ObjectAlreadyExists(what.into())
    }

    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    #[must_use]
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::JobPersistence {
            message: message.into(),
            source: None,
        }
    }

    #[must_use]
    pub fn persistence_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::JobPersistence {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    #[must_use]
    pub fn unknown_timezone(timezone: impl Into<String>) -> Self {
        Self::UnknownTimezone {
            timezone: timezone.into(),
        }
    }
}

impl From<sqlx::Error> for SchedulerError {
    fn from(source: sqlx::Error) -> Self {
        Self::persistence_with("database error", source)
    }
}

impl From<sqlx::migrate::MigrateError> for SchedulerError {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::persistence_with("migration error", source)
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(source: serde_json::Error) -> Self {
        Self::persistence_with("serialization error", source)
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

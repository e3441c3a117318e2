use deadpool_sqlite::InteractError;

/// A [std::result::Result] whose error type defaults to [Error].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can be returned from the queue.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An error occurred while updating the database to a new schema version.
    #[error("Migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),
    /// An error occurred while opening the database.
    #[error("Error opening database: {0}")]
    OpenDatabase(eyre::Report),
    /// Failed to acquire a database connection for reading.
    #[error("Error acquiring database connection: {0}")]
    Pool(#[from] deadpool_sqlite::PoolError),
    /// Encountered an error communicating with the database.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// The database contained invalid data.
    #[error("Unexpected value type for {1}: {0}")]
    ColumnType(#[source] rusqlite::Error, &'static str),
    /// An internal task panicked.
    #[error("Internal error: {0}")]
    Panic(#[from] tokio::task::JoinError),
    /// An internal error occurred while reading the database.
    #[error("Internal error: {0}")]
    DbInteract(String),
    /// A write could not acquire the database lock before the busy timeout elapsed.
    #[error("Database lock wait timed out")]
    LockContention,
    /// The named queue does not exist.
    #[error("Queue {0} not found")]
    QueueNotFound(String),
    /// The named schedule does not exist.
    #[error("Schedule {0} not found")]
    ScheduleNotFound(String),
    /// A job row had an unknown state value.
    #[error("Invalid job state {0}")]
    InvalidJobState(String),
    /// A queue row had an unknown policy value.
    #[error("Invalid queue policy {0}")]
    InvalidPolicy(String),
    /// An argument failed admission validation before touching storage.
    #[error("Invalid {argument}: {message}")]
    InvalidArgument {
        /// Which argument was rejected.
        argument: &'static str,
        /// Why it was rejected.
        message: String,
    },
    /// A cron expression could not be parsed.
    #[error("Invalid cron expression: {0}")]
    InvalidCron(String),
    /// A timezone name was not a known IANA zone.
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),
    /// Failed to serialize or deserialize a job payload or output.
    #[error("Error processing payload: {0}")]
    Payload(serde_json::Error),
    /// Invalid value for a stored timestamp.
    #[error("Timestamp {0} out of range")]
    TimestampOutOfRange(&'static str),
    /// The operation timed out. This is mostly used when the queue fails to shut down in a
    /// timely fashion.
    #[error("Timed out")]
    Timeout,
    /// Indicates that the queue has closed, and so the attempted operation could not be completed.
    #[error("Queue closed unexpectedly")]
    QueueClosed,
}

impl From<InteractError> for Error {
    fn from(e: InteractError) -> Self {
        Error::DbInteract(e.to_string())
    }
}

impl Error {
    pub(crate) fn open_database(err: impl Into<eyre::Report>) -> Self {
        Error::OpenDatabase(err.into())
    }

    pub(crate) fn invalid_argument(argument: &'static str, message: impl ToString) -> Self {
        Error::InvalidArgument {
            argument,
            message: message.to_string(),
        }
    }
}

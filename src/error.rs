use std::collections::BTreeMap;

/// Field name -> messages, suitable for inline form display.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Validation failed")]
    Validation { details: FieldErrors },

    #[error("{0}")]
    BadRequest(String),

    /// Batch-level import failure; carries the per-row errors collected so far.
    #[error("{message}")]
    Import { message: String, details: Vec<String> },

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("{0} not found")]
    NotFound(String),

    #[error("A record with this value already exists")]
    Duplicate,

    #[error("A related record was not found")]
    ForeignKey,

    #[error("Database error: {0}")]
    Store(rusqlite::Error),

    #[error("Email service not configured")]
    EmailNotConfigured,

    #[error("Email delivery failed: {0}")]
    Delivery(String),

    #[error(transparent)]
    Unknown(#[from] anyhow::Error),
}

pub type Result<T, E = AppError> = std::result::Result<T, E>;

impl AppError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        let mut details = FieldErrors::new();
        details.insert(field.to_string(), vec![message.into()]);
        AppError::Validation { details }
    }

    /// Stable machine-readable code for JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation { .. } => "VALIDATION_ERROR",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Import { .. } => "IMPORT_ERROR",
            AppError::Unauthorized => "UNAUTHORIZED",
            AppError::Forbidden => "FORBIDDEN",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Duplicate => "DUPLICATE_ENTRY",
            AppError::ForeignKey => "FOREIGN_KEY_ERROR",
            AppError::Store(_) => "DATABASE_ERROR",
            AppError::EmailNotConfigured => "EMAIL_NOT_CONFIGURED",
            AppError::Delivery(_) => "DELIVERY_FAILED",
            AppError::Unknown(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ffi::ErrorCode;

        match &err {
            rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
                match e.extended_code {
                    rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY => AppError::Duplicate,
                    rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => AppError::ForeignKey,
                    _ => AppError::Store(err),
                }
            }
            _ => AppError::Store(err),
        }
    }
}

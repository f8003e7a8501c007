use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Lookup by primary key matched no row.
    #[error("Record not found")]
    NotFound,

    #[error("Migration error: {0}")]
    Migration(String),

    /// A JSON column failed to encode.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A bincode column failed to encode.
    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

/// A column held a value the domain type does not accept.
#[derive(Error, Debug)]
#[error("invalid value {value:?} in column {column}")]
pub struct InvalidColumn {
    pub column: &'static str,
    pub value: String,
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Wrap a decoding failure for column `idx` so it can be returned from a row mapper.
pub(crate) fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

pub(crate) fn invalid_column(idx: usize, column: &'static str, value: &str) -> rusqlite::Error {
    conversion_error(
        idx,
        InvalidColumn {
            column,
            value: value.to_string(),
        },
    )
}

/// Map "no rows" to [`StoreError::NotFound`].
pub(crate) fn not_found(e: rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
        other => StoreError::Sqlite(other),
    }
}

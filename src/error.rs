use thiserror::Error;

/// Errors raised by the remote fetch collaborator. The two variants are
/// deliberately distinguishable: a `BadRequest` will fail again if retried
/// verbatim, a `Transport` failure might not.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("transport failure: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("fetch for {item_id} failed: {source}")]
    Fetch {
        item_id: String,
        #[source]
        source: FetchError,
    },
    #[error("target store {location} does not exist and cannot be created")]
    TargetUnavailable { location: String },
    #[error("audit storage failure: {0}")]
    Storage(String),
    #[error("spatial operation failed: {0}")]
    Spatial(String),
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<rusqlite_migration::Error> for SyncError {
    fn from(e: rusqlite_migration::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<serde_rusqlite::Error> for SyncError {
    fn from(e: serde_rusqlite::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

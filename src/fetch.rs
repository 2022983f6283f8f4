use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::changeset::ChangeRow;
use crate::error::FetchError;
use crate::value::Geometry;

/// What the collaborator actually sent: recorded verbatim into the audit
/// ledger after a successful apply.
#[derive(Clone, Debug)]
pub struct RequestInfo {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub params: BTreeMap<String, String>,
    pub requested_at: DateTime<Utc>,
}

/// Rows plus request metadata from one remote fetch. For a full extract
/// every row is tagged Insert; for a delta the rows carry their upstream
/// change kinds. `payload` is the raw response body, kept only so the
/// ledger can snapshot it.
#[derive(Debug)]
pub struct FetchResponse {
    pub rows: Vec<ChangeRow>,
    pub total_features: Option<i64>,
    pub request: RequestInfo,
    pub payload: Option<serde_json::Value>,
}

/// Remote data-fetch collaborator. The crop geometry, when given, is a
/// coarse bounding filter only; the remote interface may reject geometries
/// above a vertex-count limit, so precise intersection happens client-side
/// after the fetch.
pub trait FetchClient {
    fn fetch_full(
        &self,
        dataset_id: &str,
        out_srs: i32,
        crop: Option<&Geometry>,
    ) -> Result<FetchResponse, FetchError>;

    fn fetch_delta(
        &self,
        dataset_id: &str,
        from_time: &str,
        out_srs: i32,
        crop: Option<&Geometry>,
    ) -> Result<FetchResponse, FetchError>;
}

use serde::{Deserialize, Serialize};

use crate::audit::AuditLedger;
use crate::crop::CropFeature;
use crate::error::SyncError;
use crate::fetch::{FetchClient, FetchResponse};
use crate::spatial::SpatialEngine;
use crate::value::{get_field_ci, Record, Value};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A single record from a fetch, tagged with its change kind. The primary
/// key value lives in `values` under the dataset's id field.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChangeRow {
    pub kind: ChangeKind,
    pub values: Record,
}

impl ChangeRow {
    pub fn new(kind: ChangeKind, values: Record) -> Self {
        Self { kind, values }
    }

    pub fn key(&self, id_field: &str) -> Option<&Value> {
        get_field_ci(&self.values, id_field)
    }
}

/// An ordered set of tagged rows. `is_delta = false` means the rows are a
/// full extract, not a true changeset. The flag is set by whichever caller
/// decided full-vs-delta; it is never inferred from row content.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChangeSet {
    pub rows: Vec<ChangeRow>,
    pub is_delta: bool,
}

impl ChangeSet {
    pub fn delta(rows: Vec<ChangeRow>) -> Self {
        Self {
            rows,
            is_delta: true,
        }
    }

    /// Wraps a full extract. Every row is re-tagged Insert regardless of
    /// what the source said; a full extract has no prior state to diff
    /// against.
    pub fn full(rows: Vec<ChangeRow>) -> Self {
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.kind = ChangeKind::Insert;
                row
            })
            .collect();
        Self {
            rows,
            is_delta: false,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Result of the changeset fetch protocol. `SeedRequired` is a routing
/// signal, not an error: the item has no usable ledger history, so the
/// caller must perform a full extract instead.
#[derive(Debug)]
pub enum ChangesetOutcome {
    SeedRequired,
    Changes {
        changes: ChangeSet,
        response: FetchResponse,
    },
}

/// Derives the delta window for `dataset_id` from the audit ledger, issues
/// the fetch, and applies the precise client-side stage of the crop filter.
/// An empty row set is a valid outcome, distinct from an error.
pub fn fetch_changeset(
    ledger: &AuditLedger,
    client: &dyn FetchClient,
    spatial: &dyn SpatialEngine,
    dataset_id: &str,
    out_srs: i32,
    crop: Option<&CropFeature>,
) -> Result<ChangesetOutcome, SyncError> {
    let from_time = match ledger.latest_request(dataset_id, None)? {
        Some(record) if !record.request_time.is_empty() => record.request_time,
        _ => {
            log::warn!(
                "No previous request for item {} in the audit database. \
                 A full export is needed to seed the data.",
                dataset_id
            );
            return Ok(ChangesetOutcome::SeedRequired);
        }
    };

    log::info!(
        "Fetching changes for item {} since {}",
        dataset_id,
        from_time
    );
    let mut response = client
        .fetch_delta(
            dataset_id,
            &from_time,
            out_srs,
            crop.map(|c| &c.geometry),
        )
        .map_err(|source| SyncError::Fetch {
            item_id: dataset_id.to_string(),
            source,
        })?;

    let mut rows = std::mem::take(&mut response.rows);

    // Precise intersection against the crop, in the fetch's output spatial
    // reference. The server-side filter was only a bounding geometry.
    if let Some(crop) = crop {
        if !rows.is_empty() {
            let projected = spatial.project(&crop.geometry, out_srs)?;
            let before = rows.len();
            let mut kept = Vec::with_capacity(rows.len());
            for row in rows {
                if row_intersects(spatial, &row, &projected)? {
                    kept.push(row);
                }
            }
            log::debug!("Crop filter kept {} of {} rows", kept.len(), before);
            rows = kept;
        }
    }

    log::info!("Returning changes: {}", rows.len());
    Ok(ChangesetOutcome::Changes {
        changes: ChangeSet::delta(rows),
        response,
    })
}

/// Rows without a geometry field cannot be filtered spatially and are kept.
fn row_intersects(
    spatial: &dyn SpatialEngine,
    row: &ChangeRow,
    crop: &crate::value::Geometry,
) -> Result<bool, SyncError> {
    for value in row.values.values() {
        if let Value::Geometry(geometry) = value {
            return spatial.intersects(geometry, crop);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use chrono::Utc;

    use super::*;
    use crate::audit::AuditEntry;
    use crate::error::FetchError;
    use crate::fetch::RequestInfo;
    use crate::spatial::PlanarEngine;
    use crate::value::Geometry;

    /// Returns canned rows and records the from_time of each delta call.
    struct ScriptedClient {
        rows: Vec<ChangeRow>,
        delta_windows: Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        fn new(rows: Vec<ChangeRow>) -> Self {
            Self {
                rows,
                delta_windows: Mutex::new(Vec::new()),
            }
        }

        fn response(&self) -> FetchResponse {
            FetchResponse {
                rows: self.rows.clone(),
                total_features: Some(self.rows.len() as i64),
                request: RequestInfo {
                    url: "https://example.test/changeset".to_string(),
                    method: "GET".to_string(),
                    headers: BTreeMap::new(),
                    params: BTreeMap::new(),
                    requested_at: Utc::now(),
                },
                payload: None,
            }
        }
    }

    impl FetchClient for ScriptedClient {
        fn fetch_full(
            &self,
            _dataset_id: &str,
            _out_srs: i32,
            _crop: Option<&Geometry>,
        ) -> Result<FetchResponse, FetchError> {
            Ok(self.response())
        }

        fn fetch_delta(
            &self,
            _dataset_id: &str,
            from_time: &str,
            _out_srs: i32,
            _crop: Option<&Geometry>,
        ) -> Result<FetchResponse, FetchError> {
            self.delta_windows
                .lock()
                .unwrap()
                .push(from_time.to_string());
            Ok(self.response())
        }
    }

    fn point_row(kind: ChangeKind, id: &str, x: f64, y: f64) -> ChangeRow {
        let mut values = Record::new();
        values.insert("id".to_string(), Value::Id(id.to_string()));
        values.insert(
            "shape".to_string(),
            Value::Geometry(Geometry::new(2193, serde_json::json!({"x": x, "y": y}))),
        );
        ChangeRow::new(kind, values)
    }

    fn crop_feature() -> CropFeature {
        CropFeature {
            crop_layer_id: "3036".to_string(),
            crop_feature_id: "10870".to_string(),
            geometry: Geometry::new(
                2193,
                serde_json::json!({"xmin": 0.0, "ymin": 0.0, "xmax": 10.0, "ymax": 10.0}),
            ),
            url: "https://example.test/layers/3036/10870".to_string(),
        }
    }

    fn seeded_ledger(dir: &std::path::Path, item_id: &str, time: &str) -> AuditLedger {
        let ledger = AuditLedger::open(dir).unwrap();
        ledger
            .record_request(
                &AuditEntry {
                    item_id: item_id.to_string(),
                    item_kind: "vector".to_string(),
                    item_type: "layer".to_string(),
                    request_type: "export".to_string(),
                    request_url: "https://example.test/export".to_string(),
                    request_method: "GET".to_string(),
                    request_time: crate::audit::parse_request_time(time).unwrap(),
                    request_headers: BTreeMap::new(),
                    request_params: BTreeMap::new(),
                    total_features: None,
                },
                None,
            )
            .unwrap();
        ledger
    }

    #[test]
    fn no_history_signals_seed() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let ledger = AuditLedger::open(dir.path())?;
        let client = ScriptedClient::new(vec![]);

        let outcome = fetch_changeset(&ledger, &client, &PlanarEngine::new(), "50772", 2193, None)?;
        assert!(matches!(outcome, ChangesetOutcome::SeedRequired));
        // The protocol must never fabricate a window.
        assert!(client.delta_windows.lock().unwrap().is_empty());
        Ok(())
    }

    #[test]
    fn from_time_is_the_ledger_time_verbatim() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let ledger = seeded_ledger(dir.path(), "50772", "2025-01-01T00:00:00");
        let client = ScriptedClient::new(vec![point_row(ChangeKind::Update, "7", 1.0, 1.0)]);

        let outcome = fetch_changeset(&ledger, &client, &PlanarEngine::new(), "50772", 2193, None)?;
        assert_eq!(
            client.delta_windows.lock().unwrap().as_slice(),
            &["2025-01-01T00:00:00".to_string()]
        );
        match outcome {
            ChangesetOutcome::Changes { changes, .. } => {
                assert!(changes.is_delta);
                assert_eq!(changes.len(), 1);
            }
            ChangesetOutcome::SeedRequired => panic!("expected changes"),
        }
        Ok(())
    }

    #[test]
    fn crop_filters_rows_outside_region() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let ledger = seeded_ledger(dir.path(), "50772", "2025-01-01T00:00:00");
        let client = ScriptedClient::new(vec![
            point_row(ChangeKind::Insert, "1", 5.0, 5.0),
            point_row(ChangeKind::Insert, "2", 50.0, 50.0),
        ]);

        let outcome = fetch_changeset(
            &ledger,
            &client,
            &PlanarEngine::new(),
            "50772",
            2193,
            Some(&crop_feature()),
        )?;
        match outcome {
            ChangesetOutcome::Changes { changes, .. } => {
                assert_eq!(changes.len(), 1);
                assert_eq!(
                    changes.rows[0].key("id"),
                    Some(&Value::Id("1".to_string()))
                );
            }
            ChangesetOutcome::SeedRequired => panic!("expected changes"),
        }
        Ok(())
    }

    #[test]
    fn rows_without_geometry_survive_the_crop() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let ledger = seeded_ledger(dir.path(), "50772", "2025-01-01T00:00:00");
        let mut values = Record::new();
        values.insert("id".to_string(), Value::Id("9".to_string()));
        let client = ScriptedClient::new(vec![ChangeRow::new(ChangeKind::Delete, values)]);

        let outcome = fetch_changeset(
            &ledger,
            &client,
            &PlanarEngine::new(),
            "50772",
            2193,
            Some(&crop_feature()),
        )?;
        match outcome {
            ChangesetOutcome::Changes { changes, .. } => assert_eq!(changes.len(), 1),
            ChangesetOutcome::SeedRequired => panic!("expected changes"),
        }
        Ok(())
    }

    #[test]
    fn empty_delta_is_valid_and_distinct_from_seed() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let ledger = seeded_ledger(dir.path(), "50772", "2025-01-01T00:00:00");
        let client = ScriptedClient::new(vec![]);

        let outcome = fetch_changeset(&ledger, &client, &PlanarEngine::new(), "50772", 2193, None)?;
        match outcome {
            ChangesetOutcome::Changes { changes, .. } => {
                assert!(changes.is_empty());
                assert!(changes.is_delta);
            }
            ChangesetOutcome::SeedRequired => panic!("empty delta must not read as seed"),
        }
        Ok(())
    }

    #[test]
    fn full_constructor_retags_rows_as_insert() {
        let rows = vec![point_row(ChangeKind::Delete, "1", 0.0, 0.0)];
        let set = ChangeSet::full(rows);
        assert!(!set.is_delta);
        assert_eq!(set.rows[0].kind, ChangeKind::Insert);
    }
}

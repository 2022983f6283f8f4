use std::collections::BTreeMap;

use crate::apply::{apply_changes, ApplyResult};
use crate::audit::{AuditEntry, AuditLedger};
use crate::changeset::{fetch_changeset, ChangeSet, ChangesetOutcome};
use crate::crop::{CropResolver, CropSource};
use crate::error::{FetchError, SyncError};
use crate::fetch::{FetchClient, FetchResponse};
use crate::spatial::{PlanarEngine, SpatialEngine};
use crate::store::{StoreKind, TargetStore};

/// Names a crop feature on a crop layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CropRef {
    pub layer_id: String,
    pub feature_id: String,
}

/// One dataset to keep synchronized.
#[derive(Clone, Debug)]
pub struct DatasetSpec {
    pub id: String,
    pub item_kind: String,
    pub item_type: String,
    pub id_field: String,
    pub out_srs: i32,
    pub crop: Option<CropRef>,
}

impl Default for DatasetSpec {
    fn default() -> Self {
        Self {
            id: String::new(),
            item_kind: "vector".to_string(),
            item_type: "layer".to_string(),
            id_field: "id".to_string(),
            out_srs: 2193,
            crop: None,
        }
    }
}

/// Progress of one dataset through a run. Failed is reachable from every
/// non-terminal state; Recorded is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Pending,
    CropResolved,
    Fetched,
    Applied,
    Recorded,
    Failed,
}

/// What happened to one dataset. Reports for failed datasets carry the
/// error text and whatever counts accumulated before the failure.
#[derive(Clone, Debug)]
pub struct DatasetReport {
    pub dataset_id: String,
    pub state: SyncState,
    pub is_delta: bool,
    pub result: ApplyResult,
    pub error: Option<String>,
}

/// Sequences ledger, crop resolution, fetch, and application per dataset:
/// resolve crop, fetch changeset (or full extract on seed), apply, record.
/// Datasets in a batch are processed one at a time in the given order; a
/// failure in one is logged and reported without stopping the rest.
pub struct SyncEngine {
    ledger: AuditLedger,
    client: Box<dyn FetchClient>,
    crops: Option<CropResolver>,
    spatial: Box<dyn SpatialEngine>,
}

impl SyncEngine {
    pub fn builder() -> SyncEngineBuilder {
        SyncEngineBuilder::default()
    }

    pub fn ledger(&self) -> &AuditLedger {
        &self.ledger
    }

    /// Synchronizes every dataset in the batch, pairing each spec with its
    /// target store. Always returns one report per job: a failure in one
    /// dataset is logged with the state it died in and the batch continues.
    pub fn sync_all<'a, I>(&self, jobs: I) -> Vec<DatasetReport>
    where
        I: IntoIterator<Item = (&'a DatasetSpec, &'a mut dyn TargetStore)>,
    {
        let mut reports = Vec::new();
        for (spec, store) in jobs {
            let mut state = SyncState::Pending;
            let report = match self.run_dataset(spec, store, &mut state) {
                Ok((is_delta, result)) => DatasetReport {
                    dataset_id: spec.id.clone(),
                    state,
                    is_delta,
                    result,
                    error: None,
                },
                Err(e) => {
                    log::error!("Skipping dataset {} (failed in {:?}): {}", spec.id, state, e);
                    DatasetReport {
                        dataset_id: spec.id.clone(),
                        state: SyncState::Failed,
                        is_delta: false,
                        result: ApplyResult::default(),
                        error: Some(e.to_string()),
                    }
                }
            };
            reports.push(report);
        }
        log::info!("Finished processing all datasets");
        reports
    }

    /// Runs one dataset through the state machine. Errors propagate to the
    /// caller; `sync_all` is the boundary that catches them.
    pub fn sync_dataset(
        &self,
        spec: &DatasetSpec,
        store: &mut dyn TargetStore,
    ) -> Result<DatasetReport, SyncError> {
        let mut state = SyncState::Pending;
        let (is_delta, result) = self.run_dataset(spec, store, &mut state)?;
        Ok(DatasetReport {
            dataset_id: spec.id.clone(),
            state,
            is_delta,
            result,
            error: None,
        })
    }

    fn run_dataset(
        &self,
        spec: &DatasetSpec,
        store: &mut dyn TargetStore,
        state: &mut SyncState,
    ) -> Result<(bool, ApplyResult), SyncError> {
        log::info!("Processing dataset {}", spec.id);

        let crop = match &spec.crop {
            Some(crop_ref) => {
                let resolver = self.crops.as_ref().ok_or_else(|| SyncError::Fetch {
                    item_id: spec.id.clone(),
                    source: FetchError::BadRequest("no crop source configured".to_string()),
                })?;
                Some(resolver.resolve(&crop_ref.layer_id, &crop_ref.feature_id)?)
            }
            None => None,
        };
        *state = SyncState::CropResolved;

        let outcome = fetch_changeset(
            &self.ledger,
            self.client.as_ref(),
            self.spatial.as_ref(),
            &spec.id,
            spec.out_srs,
            crop.as_ref(),
        )?;
        let (changes, response) = match outcome {
            ChangesetOutcome::Changes { changes, response } => (changes, response),
            ChangesetOutcome::SeedRequired => {
                log::info!("Seeding dataset {} with a full extract", spec.id);
                let mut response = self
                    .client
                    .fetch_full(&spec.id, spec.out_srs, crop.as_ref().map(|c| &c.geometry))
                    .map_err(|source| SyncError::Fetch {
                        item_id: spec.id.clone(),
                        source,
                    })?;
                let rows = std::mem::take(&mut response.rows);
                (ChangeSet::full(rows), response)
            }
        };
        *state = SyncState::Fetched;

        self.ensure_target(store)?;

        let result = if !changes.is_delta && !changes.is_empty() {
            // Full materialization: there is no prior state to reconcile
            // against, so replace the store contents wholesale.
            log::info!(
                "Materializing {} rows into {}",
                changes.len(),
                store.location()
            );
            store.truncate()?;
            apply_changes(&changes, store, &spec.id_field)?
        } else {
            apply_changes(&changes, store, &spec.id_field)?
        };
        *state = SyncState::Applied;

        // Ledger entries mark time, not non-emptiness: record even when
        // nothing changed. Apply and record are independently committed; a
        // record failure leaves the applied changes standing.
        self.record(spec, &changes, &response)?;
        *state = SyncState::Recorded;

        Ok((changes.is_delta, result))
    }

    fn ensure_target(&self, store: &mut dyn TargetStore) -> Result<(), SyncError> {
        if store.exists()? {
            return Ok(());
        }
        match store.kind() {
            StoreKind::File => {
                log::info!("Creating target store {}", store.location());
                store.create()
            }
            StoreKind::Enterprise => Err(SyncError::TargetUnavailable {
                location: store.location().to_string(),
            }),
        }
    }

    fn record(
        &self,
        spec: &DatasetSpec,
        changes: &ChangeSet,
        response: &FetchResponse,
    ) -> Result<(), SyncError> {
        let entry = AuditEntry {
            item_id: spec.id.clone(),
            item_kind: spec.item_kind.clone(),
            item_type: spec.item_type.clone(),
            request_type: if changes.is_delta {
                "changeset".to_string()
            } else {
                "export".to_string()
            },
            request_url: response.request.url.clone(),
            request_method: response.request.method.clone(),
            request_time: response.request.requested_at,
            request_headers: response.request.headers.clone(),
            request_params: response.request.params.clone(),
            total_features: response.total_features,
        };
        self.ledger.record_request(&entry, response.payload.as_ref())
    }
}

#[derive(Default)]
pub struct SyncEngineBuilder {
    ledger: Option<AuditLedger>,
    client: Option<Box<dyn FetchClient>>,
    crop_source: Option<Box<dyn CropSource>>,
    spatial: Option<Box<dyn SpatialEngine>>,
}

impl SyncEngineBuilder {
    pub fn ledger(mut self, ledger: AuditLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn client(mut self, client: Box<dyn FetchClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn crop_source(mut self, source: Box<dyn CropSource>) -> Self {
        self.crop_source = Some(source);
        self
    }

    pub fn spatial(mut self, spatial: Box<dyn SpatialEngine>) -> Self {
        self.spatial = Some(spatial);
        self
    }

    pub fn build(self) -> SyncEngine {
        SyncEngine {
            ledger: self.ledger.unwrap_or_else(AuditLedger::disabled),
            client: self.client.expect("a fetch client is required"),
            crops: self.crop_source.map(CropResolver::new),
            spatial: self
                .spatial
                .unwrap_or_else(|| Box::new(PlanarEngine::new())),
        }
    }
}

/// Convenience for adapters and tests that assemble header or parameter
/// maps by hand.
pub fn request_params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{FetchError, SyncError};
use crate::value::Geometry;

/// Remote lookup for a named crop region. Implementations are external
/// collaborators (a catalog HTTP client, a local file, a test fake).
pub trait CropSource {
    fn get_crop_feature(
        &self,
        layer_id: &str,
        feature_id: &str,
    ) -> Result<CropFeature, FetchError>;
}

/// A cached crop region used to spatially bound a fetch.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CropFeature {
    pub crop_layer_id: String,
    pub crop_feature_id: String,
    pub geometry: Geometry,
    pub url: String,
}

/// Resolves crop regions, fetching each (layer, feature) pair at most once
/// per run. The cache is never invalidated within a run; remote crop data
/// is assumed stable for the run's duration. The map is mutex-guarded even
/// though the run model is sequential.
pub struct CropResolver {
    source: Box<dyn CropSource>,
    cache: Mutex<HashMap<String, CropFeature>>,
}

impl CropResolver {
    pub fn new(source: Box<dyn CropSource>) -> Self {
        Self {
            source,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn resolve(&self, layer_id: &str, feature_id: &str) -> Result<CropFeature, SyncError> {
        let cache_key = format!("{}_{}", layer_id, feature_id);

        let mut cache = self
            .cache
            .lock()
            .map_err(|_| SyncError::Storage("failed to acquire crop cache lock".to_string()))?;
        if let Some(feature) = cache.get(&cache_key) {
            log::debug!("Crop cache hit for {}", cache_key);
            return Ok(feature.clone());
        }

        log::info!(
            "Fetching crop feature {} from layer {}",
            feature_id,
            layer_id
        );
        let feature = self
            .source
            .get_crop_feature(layer_id, feature_id)
            .map_err(|source| SyncError::Fetch {
                item_id: cache_key.clone(),
                source,
            })?;
        cache.insert(cache_key, feature.clone());
        Ok(feature)
    }
}

//! Adapter Lifecycle Manager — At-Most-Once LoRA Loading
//!
//! Guarantees a named fine-tuned adapter is loaded on the remote inference
//! server before first use, exactly once per process, no matter how many
//! concurrent callers race on the first request.
//!
//! ## Two-level locking
//!
//! A process-wide mutex guards the **map of per-adapter locks** and is held
//! only for the map lookup/insert, never across network I/O. The per-adapter
//! mutex guards the **loading operation**. Unrelated adapters load fully in
//! parallel; same-adapter races serialize on one lock, and the double-check
//! after acquisition collapses them into a single network load.
//!
//! The loaded set only grows: adapters are never unloaded during the
//! process lifetime.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};

use super::types::GatewayError;
use super::wire::{LoadAdapterRequest, ModelList};

/// Timeout for the model-list pre-check.
const LIST_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the load request itself (the server may fetch weights).
const LOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Ensures adapters are loaded on the remote server, at most once each.
///
/// Construct once (inside [`Gateway`](super::executor::Gateway)); all
/// methods take `&self`.
pub struct AdapterManager {
    http: reqwest::Client,
    loaded: RwLock<HashSet<String>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for AdapterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterManager").finish()
    }
}

impl Default for AdapterManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterManager {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            loaded: RwLock::new(HashSet::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the adapter is known-loaded (fast path, no network).
    pub async fn is_loaded(&self, adapter: &str) -> bool {
        self.loaded.read().await.contains(adapter)
    }

    /// Ensure `adapter` is loaded on the server at `base_url`.
    ///
    /// Returns immediately when the adapter is already in the loaded set.
    /// Otherwise serializes with concurrent callers for the same adapter,
    /// re-checks, and performs at most one network load. A load rejection
    /// whose body says the adapter is already loaded counts as success
    /// (compatibility fallback; the list pre-check is the primary
    /// out-of-band detection). Any other failure propagates as
    /// [`GatewayError::AdapterLoad`] — siblings waiting on the same lock
    /// will re-attempt and observe the failure themselves rather than
    /// mask it.
    pub async fn ensure_loaded(
        &self,
        adapter: &str,
        base_url: &str,
        api_key: Option<&str>,
    ) -> Result<(), GatewayError> {
        if self.is_loaded(adapter).await {
            return Ok(());
        }

        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(adapter.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let _guard = lock.lock().await;

        // Another caller may have finished while this one waited.
        if self.is_loaded(adapter).await {
            return Ok(());
        }

        // Pre-check: the server may already have it (loaded out-of-band).
        match self.list_models(base_url, api_key).await {
            Ok(models) if models.contains(adapter) => {
                tracing::info!(
                    "AdapterManager: '{adapter}' already present on {base_url}, marking loaded"
                );
                self.loaded.write().await.insert(adapter.to_string());
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                // The load attempt below gives the definitive answer.
                tracing::warn!("AdapterManager: model-list pre-check failed on {base_url}: {e}");
            }
        }

        self.load(adapter, base_url, api_key).await?;

        self.loaded.write().await.insert(adapter.to_string());
        tracing::info!("AdapterManager: loaded '{adapter}' on {base_url}");
        Ok(())
    }

    async fn list_models(
        &self,
        base_url: &str,
        api_key: Option<&str>,
    ) -> Result<ModelList, GatewayError> {
        let mut request = self
            .http
            .get(format!("{base_url}/models"))
            .timeout(LIST_TIMEOUT);
        if let Some(key) = api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::TransientProvider(format!("model list failed: {e}")))?;
        response
            .json::<ModelList>()
            .await
            .map_err(|e| GatewayError::TransientProvider(format!("model list malformed: {e}")))
    }

    async fn load(
        &self,
        adapter: &str,
        base_url: &str,
        api_key: Option<&str>,
    ) -> Result<(), GatewayError> {
        let body = LoadAdapterRequest {
            lora_name: adapter.to_string(),
            // HF-style repo id doubles as the path; the server resolves it.
            lora_path: adapter.to_string(),
        };

        let mut request = self
            .http
            .post(format!("{base_url}/load_lora_adapter"))
            .timeout(LOAD_TIMEOUT)
            .json(&body);
        if let Some(key) = api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| GatewayError::AdapterLoad {
            name: adapter.to_string(),
            reason: format!("load request failed: {e}"),
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if body.to_ascii_lowercase().contains("already loaded") {
            tracing::debug!(
                "AdapterManager: server reports '{adapter}' already loaded ({status}), treating as success"
            );
            return Ok(());
        }

        Err(GatewayError::AdapterLoad {
            name: adapter.to_string(),
            reason: format!("server returned {status}: {body}"),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_not_loaded_initially() {
        let manager = AdapterManager::new();
        assert!(!manager.is_loaded("acme/character-v3").await);
    }

    #[tokio::test]
    async fn test_lock_map_one_entry_per_adapter() {
        let manager = AdapterManager::new();
        for _ in 0..3 {
            let mut locks = manager.locks.lock().await;
            locks
                .entry("acme/character-v3".to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())));
        }
        assert_eq!(manager.locks.lock().await.len(), 1);
    }

    #[test]
    fn test_manager_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AdapterManager>();
    }
}

//! Turning task return values into state payloads.

use std::sync::Arc;

use serde_json::Value;

use weir_api::models::ResultPayload;
use weir_api::storage::{LocalResultStore, ResultError};

use crate::task::Task;

/// Serializes a task's return value into the payload carried by its
/// terminal state.
#[derive(Clone)]
pub struct ResultFactory {
    pub persist: bool,
    pub store: Option<Arc<LocalResultStore>>,
}

impl ResultFactory {
    /// Build the factory for a task.
    ///
    /// A cached task persists even when result persistence was not asked
    /// for: the cached payload must be readable by other invocations. A
    /// persisting task with no configured storage falls back to the default
    /// store location.
    pub fn from_task(task: &Task) -> Self {
        let persist = task.persist_result || task.cache_key_fn.is_some();
        let store = task.result_storage.clone().or_else(|| {
            persist.then(|| Arc::new(LocalResultStore::new(LocalResultStore::default_path())))
        });
        Self { persist, store }
    }

    /// Produce the payload for `value`. Persisted payloads are keyed by the
    /// cache key when one exists, else by content address.
    pub fn create(&self, value: &Value, cache_key: Option<&str>) -> Result<ResultPayload, ResultError> {
        if self.persist {
            if let Some(store) = &self.store {
                let key = cache_key
                    .map(str::to_owned)
                    .unwrap_or_else(|| LocalResultStore::key_for(value));
                store.persist(&key, value)?;
                return Ok(ResultPayload::Persisted { storage_key: key });
            }
        }
        Ok(ResultPayload::Literal(value.clone()))
    }
}

//! Bounded model cache owned by the worker.
//!
//! Entries are evicted oldest-inserted-first once the cache grows past its
//! capacity; reads do not refresh an entry's position. Keys that are being
//! loaded live in a separate progress table and only enter the cache once the
//! load succeeds, so a key is never both cached and loading.
//!
//! There is no per-key load lock: two first requests for the same uncached
//! key both load, and the later insert overwrites the earlier one in place.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, info, warn};
use offline_translate_types::{ErrorKind, TranslateError, WorkerSettings};
use tokio_util::sync::CancellationToken;

use crate::model::{ModelKey, ModelLoader, SharedModel};

/// Per-call options for [`ModelCache::resolve`].
pub struct ResolveOptions<'a> {
    pub on_progress: Option<&'a dyn Fn(u8, &str)>,
    pub cancel: &'a CancellationToken,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<ModelKey, SharedModel>,
    insertion_order: VecDeque<ModelKey>,
    loading: HashMap<ModelKey, u8>,
}

pub struct ModelCache {
    loader: Arc<dyn ModelLoader>,
    enabled: bool,
    capacity: usize,
    use_quantized: bool,
    state: RwLock<CacheState>,
}

impl ModelCache {
    pub fn new(loader: Arc<dyn ModelLoader>, settings: &WorkerSettings) -> Self {
        Self {
            loader,
            enabled: settings.cache_models,
            capacity: settings.max_cache_size,
            use_quantized: settings.use_quantized,
            state: RwLock::new(CacheState::default()),
        }
    }

    pub fn key_for(&self, task: &str, model_id: &str) -> ModelKey {
        ModelKey::new(task, model_id, self.use_quantized)
    }

    /// Resolve `(task, model_id)` to a loaded model, loading it on a miss.
    ///
    /// A hit returns immediately without touching `on_progress`. A miss
    /// reports non-decreasing percentages and always ends with `100` unless
    /// the load fails.
    pub fn resolve(
        &self,
        task: &str,
        model_id: &str,
        request_id: &str,
        options: ResolveOptions<'_>,
    ) -> Result<SharedModel, TranslateError> {
        let key = self.key_for(task, model_id);
        if let Some(model) = self.get(&key) {
            debug!("[CACHE] Hit for {key} (request {request_id})");
            return Ok(model);
        }
        if options.cancel.is_cancelled() {
            return Err(TranslateError::cancelled(request_id));
        }

        info!("[CACHE] Loading {key} for request {request_id}");
        self.write_state().loading.insert(key.clone(), 0);

        let mut last = 0u8;
        let mut report = |pct: u8, message: &str| {
            let pct = pct.min(100).max(last);
            last = pct;
            self.set_loading_progress(&key, pct);
            if let Some(on_progress) = options.on_progress {
                on_progress(pct, message);
            }
        };

        report(0, "Loading model");
        match self.loader.load(&key, &mut report, options.cancel) {
            Ok(model) => {
                report(100, "Model loaded");
                self.insert(key, model.clone());
                Ok(model)
            }
            Err(err) => {
                self.write_state().loading.remove(&key);
                if options.cancel.is_cancelled() {
                    info!("[CACHE] Load of {key} cancelled (request {request_id})");
                    return Err(TranslateError::cancelled(request_id));
                }
                warn!("[CACHE] Load of {key} failed: {err}");
                Err(match err.kind {
                    ErrorKind::Cancelled | ErrorKind::ModelLoadFailed => err,
                    _ => TranslateError::new(ErrorKind::ModelLoadFailed, err.message),
                })
            }
        }
    }

    pub fn get(&self, key: &ModelKey) -> Option<SharedModel> {
        self.read_state().entries.get(key).cloned()
    }

    pub fn is_cached(&self, key: &ModelKey) -> bool {
        self.read_state().entries.contains_key(key)
    }

    /// Load percentage of a key currently being loaded.
    pub fn loading_progress(&self, key: &ModelKey) -> Option<u8> {
        self.read_state().loading.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.read_state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached keys, oldest insertion first.
    pub fn cached_keys(&self) -> Vec<ModelKey> {
        self.read_state().insertion_order.iter().cloned().collect()
    }

    pub fn remove(&self, key: &ModelKey) -> bool {
        let mut state = self.write_state();
        state.insertion_order.retain(|k| k != key);
        state.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        let mut state = self.write_state();
        state.entries.clear();
        state.insertion_order.clear();
    }

    fn insert(&self, key: ModelKey, model: SharedModel) {
        let mut state = self.write_state();
        state.loading.remove(&key);
        if !self.enabled {
            return;
        }
        if state.entries.insert(key.clone(), model).is_some() {
            debug!("[CACHE] Replaced {key} (duplicate load)");
            return;
        }
        state.insertion_order.push_back(key);
        while state.entries.len() > self.capacity {
            let Some(oldest) = state.insertion_order.pop_front() else {
                break;
            };
            state.entries.remove(&oldest);
            info!("[CACHE] Evicted {oldest}");
        }
    }

    fn set_loading_progress(&self, key: &ModelKey, pct: u8) {
        let mut state = self.write_state();
        if let Some(entry) = state.loading.get_mut(key) {
            *entry = pct;
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockLoader, MockLoaderOptions};
    use offline_translate_types::languages::TRANSLATION_TASK;
    use std::sync::Mutex;

    fn settings(capacity: usize) -> WorkerSettings {
        WorkerSettings {
            cache_models: true,
            use_quantized: true,
            max_cache_size: capacity,
            max_concurrency: 2,
        }
    }

    fn resolve(cache: &ModelCache, model_id: &str) -> Result<SharedModel, TranslateError> {
        let cancel = CancellationToken::new();
        cache.resolve(
            TRANSLATION_TASK,
            model_id,
            "req",
            ResolveOptions {
                on_progress: None,
                cancel: &cancel,
            },
        )
    }

    #[test]
    fn test_fifo_eviction_ignores_recent_use() {
        let loader = Arc::new(MockLoader::new(MockLoaderOptions::default()));
        let cache = ModelCache::new(loader.clone(), &settings(2));

        resolve(&cache, "A").unwrap();
        resolve(&cache, "B").unwrap();
        // A is now the most recently used entry; FIFO must still evict it.
        resolve(&cache, "A").unwrap();
        assert_eq!(loader.load_count(), 2);

        resolve(&cache, "C").unwrap();
        assert!(!cache.is_cached(&cache.key_for(TRANSLATION_TASK, "A")));
        assert!(cache.is_cached(&cache.key_for(TRANSLATION_TASK, "B")));
        assert!(cache.is_cached(&cache.key_for(TRANSLATION_TASK, "C")));
        let order: Vec<String> = cache.cached_keys().into_iter().map(|k| k.model_id).collect();
        assert_eq!(order, vec!["B", "C"]);
    }

    #[test]
    fn test_progress_is_monotonic_and_terminates_at_100() {
        let loader = Arc::new(MockLoader::new(MockLoaderOptions {
            progress_steps: vec![10, 50, 30, 90],
            ..MockLoaderOptions::default()
        }));
        let cache = ModelCache::new(loader, &settings(2));
        let seen = Mutex::new(Vec::new());
        let on_progress = |pct: u8, _: &str| seen.lock().unwrap().push(pct);
        let cancel = CancellationToken::new();

        cache
            .resolve(
                TRANSLATION_TASK,
                "A",
                "req",
                ResolveOptions {
                    on_progress: Some(&on_progress),
                    cancel: &cancel,
                },
            )
            .unwrap();

        let seen = seen.into_inner().unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
        assert_eq!(seen.first(), Some(&0));
        assert_eq!(seen.last(), Some(&100));
    }

    #[test]
    fn test_hit_reports_no_progress() {
        let loader = Arc::new(MockLoader::new(MockLoaderOptions::default()));
        let cache = ModelCache::new(loader, &settings(2));
        resolve(&cache, "A").unwrap();

        let calls = Mutex::new(0);
        let on_progress = |_: u8, _: &str| *calls.lock().unwrap() += 1;
        let cancel = CancellationToken::new();
        cache
            .resolve(
                TRANSLATION_TASK,
                "A",
                "req",
                ResolveOptions {
                    on_progress: Some(&on_progress),
                    cancel: &cancel,
                },
            )
            .unwrap();
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_failed_load_is_not_cached() {
        let loader = Arc::new(MockLoader::new(MockLoaderOptions {
            fail_models: vec!["broken".to_string()],
            ..MockLoaderOptions::default()
        }));
        let cache = ModelCache::new(loader, &settings(2));

        let err = resolve(&cache, "broken").err().unwrap();
        assert_eq!(err.kind, ErrorKind::ModelLoadFailed);
        let key = cache.key_for(TRANSLATION_TASK, "broken");
        assert!(!cache.is_cached(&key));
        assert_eq!(cache.loading_progress(&key), None);
    }

    #[test]
    fn test_cancelled_before_load() {
        let loader = Arc::new(MockLoader::new(MockLoaderOptions::default()));
        let cache = ModelCache::new(loader.clone(), &settings(2));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = cache
            .resolve(
                TRANSLATION_TASK,
                "A",
                "req",
                ResolveOptions {
                    on_progress: None,
                    cancel: &cancel,
                },
            )
            .err()
            .unwrap();
        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert_eq!(loader.load_count(), 0);
    }

    #[test]
    fn test_disabled_cache_loads_every_time() {
        let loader = Arc::new(MockLoader::new(MockLoaderOptions::default()));
        let mut s = settings(2);
        s.cache_models = false;
        let cache = ModelCache::new(loader.clone(), &s);

        resolve(&cache, "A").unwrap();
        resolve(&cache, "A").unwrap();
        assert_eq!(loader.load_count(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_remove_and_clear() {
        let loader = Arc::new(MockLoader::new(MockLoaderOptions::default()));
        let cache = ModelCache::new(loader, &settings(3));
        resolve(&cache, "A").unwrap();
        resolve(&cache, "B").unwrap();

        assert!(cache.remove(&cache.key_for(TRANSLATION_TASK, "A")));
        assert!(!cache.remove(&cache.key_for(TRANSLATION_TASK, "A")));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.cached_keys().is_empty());
    }

    #[test]
    fn test_concurrent_first_requests_both_load() {
        let loader = Arc::new(MockLoader::new(MockLoaderOptions {
            load_rendezvous: Some(2),
            ..MockLoaderOptions::default()
        }));
        let cache = Arc::new(ModelCache::new(loader.clone(), &settings(2)));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || resolve(&cache, "A").is_ok())
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }

        assert_eq!(loader.load_count(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.cached_keys().len(), 1);
    }
}

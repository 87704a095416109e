//! Engine registry, instance cache, and fallback resolution.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::engine::{self, EngineDescriptor, OcrEngine, FALLBACK_CHAIN};
use crate::error::FactoryError;

/// Builds an adapter from a config. Initialization is the factory's job.
pub type Constructor =
    Box<dyn Fn(&EngineConfig) -> anyhow::Result<Arc<dyn OcrEngine>> + Send + Sync>;

struct Registration {
    descriptor: EngineDescriptor,
    build: Constructor,
}

/// Creates, caches and fallback-resolves engine adapters.
///
/// Constructed once at startup and shared by reference; each test builds its
/// own instance. Locks are never held across an await point, so concurrent
/// first requests for the same key may construct duplicate adapters; the last
/// write wins, which is benign because instances are stateless between calls.
pub struct EngineFactory {
    registry: RwLock<HashMap<String, Arc<Registration>>>,
    cache: Mutex<HashMap<String, Arc<dyn OcrEngine>>>,
    fallback_chain: Vec<String>,
}

impl Default for EngineFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineFactory {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            fallback_chain: FALLBACK_CHAIN.iter().map(|id| id.to_string()).collect(),
        }
    }

    /// Replace the fallback chain (tests, exotic deployments).
    pub fn with_fallback_chain(mut self, chain: Vec<String>) -> Self {
        self.fallback_chain = chain;
        self
    }

    /// Add or replace a registry entry. No availability validation.
    pub fn register(&self, descriptor: EngineDescriptor, build: Constructor) {
        let id = descriptor.id.clone();
        self.registry
            .write()
            .unwrap()
            .insert(id, Arc::new(Registration { descriptor, build }));
    }

    /// Probe and register every built-in engine.
    ///
    /// No-op once the registry holds any entry: availability decided at the
    /// first scan is final for the process. [`rescan`](Self::rescan) is the
    /// explicit way to re-probe.
    pub fn ensure_registered(&self) {
        if !self.registry.read().unwrap().is_empty() {
            return;
        }
        self.scan();
    }

    /// Drop all registrations and probe the built-in engines again.
    pub fn rescan(&self) {
        self.registry.write().unwrap().clear();
        self.scan();
    }

    fn scan(&self) {
        match engine::tesseract::probe() {
            Ok(descriptor) => self.register(
                descriptor,
                Box::new(|config| {
                    Ok(Arc::new(engine::tesseract::TesseractEngine::new(config)?)
                        as Arc<dyn OcrEngine>)
                }),
            ),
            Err(err) => debug!("tesseract unavailable: {err}"),
        }

        match engine::paddle::probe() {
            Ok(descriptor) => self.register(
                descriptor,
                Box::new(|config| {
                    Ok(Arc::new(engine::paddle::PaddleOcrEngine::new(config)?)
                        as Arc<dyn OcrEngine>)
                }),
            ),
            Err(err) => debug!("paddleocr unavailable: {err}"),
        }

        match engine::easyocr::probe() {
            Ok(descriptor) => self.register(
                descriptor,
                Box::new(|config| {
                    Ok(Arc::new(engine::easyocr::EasyOcrEngine::new(config)?)
                        as Arc<dyn OcrEngine>)
                }),
            ),
            Err(err) => debug!("easyocr unavailable: {err}"),
        }

        match engine::gutenocr::probe() {
            Ok(descriptors) => {
                for descriptor in descriptors {
                    let id = descriptor.id.clone();
                    self.register(
                        descriptor,
                        Box::new(move |config| {
                            Ok(Arc::new(engine::gutenocr::GutenOcrEngine::new(config, &id)?)
                                as Arc<dyn OcrEngine>)
                        }),
                    );
                }
            }
            Err(err) => debug!("gutenocr unavailable: {err}"),
        }

        match engine::mistral::probe() {
            Ok(descriptor) => self.register(
                descriptor,
                Box::new(|config| {
                    Ok(Arc::new(engine::mistral::MistralOcrEngine::new(config)?)
                        as Arc<dyn OcrEngine>)
                }),
            ),
            Err(err) => debug!("mistral_ocr unavailable: {err}"),
        }

        let count = self.registry.read().unwrap().len();
        info!("engine registry populated: {count} engines");
    }

    /// Resolve an engine id to a ready adapter instance.
    ///
    /// With `use_fallback`, any construction-time failure (unknown id,
    /// disabled config, constructor or initialization error) walks the
    /// fallback chain instead of surfacing.
    pub async fn create_engine(
        &self,
        id: &str,
        config: &EngineConfig,
        use_fallback: bool,
        cache_instance: bool,
    ) -> Result<Arc<dyn OcrEngine>, FactoryError> {
        self.ensure_registered();

        let key = fingerprint(id, config);
        if cache_instance {
            if let Some(cached) = self.cache.lock().unwrap().get(&key) {
                debug!("engine cache hit: {id}");
                return Ok(cached.clone());
            }
        }

        match self.try_create(id, config, true).await {
            Ok(instance) => {
                if cache_instance {
                    self.cache.lock().unwrap().insert(key, instance.clone());
                }
                Ok(instance)
            }
            Err(err) if use_fallback => {
                warn!("engine {id} unusable ({err}), walking fallback chain");
                self.resolve_fallback(id, config, err, cache_instance.then_some(key))
                    .await
            }
            Err(err) => Err(err),
        }
    }

    /// Single-engine path: registry lookup, disabled gate, construction,
    /// initialization.
    async fn try_create(
        &self,
        id: &str,
        config: &EngineConfig,
        check_enabled: bool,
    ) -> Result<Arc<dyn OcrEngine>, FactoryError> {
        let registration = self.registry.read().unwrap().get(id).cloned();
        let Some(registration) = registration else {
            return Err(FactoryError::EngineNotFound {
                requested: id.to_string(),
                available: self.available_ids(),
            });
        };

        if check_enabled && !config.enabled {
            return Err(FactoryError::EngineDisabled(id.to_string()));
        }

        let instance = (registration.build)(config).map_err(|err| {
            FactoryError::ConstructionFailed {
                id: id.to_string(),
                message: format!("{err:#}"),
            }
        })?;
        instance
            .initialize()
            .await
            .map_err(|err| FactoryError::ConstructionFailed {
                id: id.to_string(),
                message: format!("{err:#}"),
            })?;

        Ok(instance)
    }

    /// Walk the fallback chain with the caller's config. The first success is
    /// cached under the *original* request's fingerprint, so an identical
    /// follow-up request resolves from cache without re-walking the chain.
    async fn resolve_fallback(
        &self,
        requested: &str,
        config: &EngineConfig,
        original_err: FactoryError,
        cache_key: Option<String>,
    ) -> Result<Arc<dyn OcrEngine>, FactoryError> {
        let mut attempts = vec![format!("{requested}: {original_err}")];

        for candidate in &self.fallback_chain {
            if candidate == requested {
                continue;
            }
            if !self.registry.read().unwrap().contains_key(candidate) {
                attempts.push(format!("{candidate}: not registered"));
                continue;
            }

            // The `enabled` flag is scoped to the engine it was written for;
            // chain members run with the rest of the caller's config as-is.
            match self.try_create(candidate, config, false).await {
                Ok(instance) => {
                    info!("fallback engine {candidate} substituted for {requested}");
                    if let Some(key) = cache_key {
                        self.cache.lock().unwrap().insert(key, instance.clone());
                    }
                    return Ok(instance);
                }
                Err(err) => attempts.push(format!("{candidate}: {err}")),
            }
        }

        Err(FactoryError::NoEngineAvailable { attempts })
    }

    /// Clean up and drop every cached instance. Idempotent.
    pub async fn clear_cache(&self) {
        let drained: Vec<Arc<dyn OcrEngine>> = {
            let mut cache = self.cache.lock().unwrap();
            cache.drain().map(|(_, instance)| instance).collect()
        };
        for instance in drained {
            instance.cleanup().await;
        }
    }

    /// Registered engine ids, probing built-ins first if needed.
    pub fn get_available_engines(&self) -> Vec<String> {
        self.ensure_registered();
        self.available_ids()
    }

    /// Descriptors for every registered engine, sorted by id.
    pub fn descriptors(&self) -> Vec<EngineDescriptor> {
        self.ensure_registered();
        let mut list: Vec<EngineDescriptor> = self
            .registry
            .read()
            .unwrap()
            .values()
            .map(|r| r.descriptor.clone())
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn descriptor(&self, id: &str) -> Option<EngineDescriptor> {
        self.ensure_registered();
        self.registry
            .read()
            .unwrap()
            .get(id)
            .map(|r| r.descriptor.clone())
    }

    fn available_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registry.read().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    #[cfg(test)]
    fn cached_count(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}

/// Deterministic cache key over the engine id and the full config content.
fn fingerprint(id: &str, config: &EngineConfig) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update(b"\0");
    if let Ok(bytes) = serde_json::to_vec(config) {
        hasher.update(&bytes);
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineKind, Metadata, OcrResult};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockEngine {
        id: String,
        cleanups: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl OcrEngine for MockEngine {
        fn name(&self) -> &str {
            &self.id
        }

        async fn initialize(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn process_bytes(&self, _bytes: &[u8]) -> anyhow::Result<OcrResult> {
            Ok(OcrResult::empty(Metadata::new(&self.id, "cpu", vec![])))
        }

        async fn cleanup(&self) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn descriptor(id: &str) -> EngineDescriptor {
        EngineDescriptor {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            kind: EngineKind::Traditional,
            languages: vec![],
            gpu_required: false,
            cost_per_page: 0.0,
        }
    }

    fn register_mock(factory: &EngineFactory, id: &str) -> Arc<AtomicUsize> {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let counter = cleanups.clone();
        let owned = id.to_string();
        factory.register(
            descriptor(id),
            Box::new(move |_config| {
                Ok(Arc::new(MockEngine {
                    id: owned.clone(),
                    cleanups: counter.clone(),
                }) as Arc<dyn OcrEngine>)
            }),
        );
        cleanups
    }

    fn register_failing(factory: &EngineFactory, id: &str) {
        factory.register(
            descriptor(id),
            Box::new(|_config| anyhow::bail!("model load failed")),
        );
    }

    #[tokio::test]
    async fn unknown_engine_without_fallback() {
        let factory = EngineFactory::new();
        register_mock(&factory, "mock");

        let err = factory
            .create_engine("ghost", &EngineConfig::default(), false, true)
            .await
            .unwrap_err();

        match err {
            FactoryError::EngineNotFound { requested, available } => {
                assert_eq!(requested, "ghost");
                assert_eq!(available, vec!["mock".to_string()]);
            }
            other => panic!("expected EngineNotFound, got: {other}"),
        }
    }

    #[tokio::test]
    async fn disabled_engine_without_fallback() {
        let factory = EngineFactory::new();
        register_mock(&factory, "mock");

        let config = EngineConfig {
            enabled: false,
            ..Default::default()
        };
        let err = factory
            .create_engine("mock", &config, false, true)
            .await
            .unwrap_err();
        assert!(matches!(err, FactoryError::EngineDisabled(_)));
    }

    #[tokio::test]
    async fn cache_returns_identical_instance() {
        let factory = EngineFactory::new();
        register_mock(&factory, "mock");

        let config = EngineConfig::default();
        let first = factory.create_engine("mock", &config, true, true).await.unwrap();
        let second = factory.create_engine("mock", &config, true, true).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        // A different config fingerprint constructs a fresh instance.
        let other_config = EngineConfig {
            languages: vec!["de".to_string()],
            ..Default::default()
        };
        let third = factory
            .create_engine("mock", &other_config, true, true)
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(factory.cached_count(), 2);
    }

    #[tokio::test]
    async fn uncached_requests_always_construct() {
        let factory = EngineFactory::new();
        register_mock(&factory, "mock");

        let config = EngineConfig::default();
        let first = factory.create_engine("mock", &config, true, false).await.unwrap();
        let second = factory.create_engine("mock", &config, true, false).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(factory.cached_count(), 0);
    }

    #[tokio::test]
    async fn clear_cache_cleans_each_instance_once() {
        let factory = EngineFactory::new();
        let cleanups = register_mock(&factory, "mock");

        let config = EngineConfig::default();
        let first = factory.create_engine("mock", &config, true, true).await.unwrap();

        factory.clear_cache().await;
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(factory.cached_count(), 0);

        // Idempotent on an empty cache.
        factory.clear_cache().await;
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);

        let fresh = factory.create_engine("mock", &config, true, true).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &fresh));
    }

    #[tokio::test]
    async fn fallback_substitutes_for_unknown_engine() {
        let factory =
            EngineFactory::new().with_fallback_chain(vec!["fb".to_string()]);
        register_mock(&factory, "fb");

        let config = EngineConfig::default();
        let instance = factory
            .create_engine("ghost", &config, true, true)
            .await
            .unwrap();
        assert_eq!(instance.name(), "fb");

        // The winner is cached under the original request's key: a second
        // call for "ghost" resolves without re-walking the chain.
        let again = factory.create_engine("ghost", &config, true, true).await.unwrap();
        assert!(Arc::ptr_eq(&instance, &again));
    }

    #[tokio::test]
    async fn fallback_substitutes_for_disabled_engine() {
        let factory =
            EngineFactory::new().with_fallback_chain(vec!["fb".to_string()]);
        register_mock(&factory, "primary");
        register_mock(&factory, "fb");

        let config = EngineConfig {
            enabled: false,
            ..Default::default()
        };
        let instance = factory
            .create_engine("primary", &config, true, true)
            .await
            .unwrap();
        assert_eq!(instance.name(), "fb");
    }

    #[tokio::test]
    async fn fallback_substitutes_for_failed_construction() {
        let factory =
            EngineFactory::new().with_fallback_chain(vec!["fb".to_string()]);
        register_failing(&factory, "primary");
        register_mock(&factory, "fb");

        let instance = factory
            .create_engine("primary", &EngineConfig::default(), true, true)
            .await
            .unwrap();
        assert_eq!(instance.name(), "fb");
    }

    #[tokio::test]
    async fn construction_failure_without_fallback_surfaces() {
        let factory = EngineFactory::new();
        register_failing(&factory, "primary");

        let err = factory
            .create_engine("primary", &EngineConfig::default(), false, true)
            .await
            .unwrap_err();
        match err {
            FactoryError::ConstructionFailed { id, message } => {
                assert_eq!(id, "primary");
                assert!(message.contains("model load failed"));
            }
            other => panic!("expected ConstructionFailed, got: {other}"),
        }
    }

    #[tokio::test]
    async fn exhausted_chain_aggregates_every_attempt() {
        let factory = EngineFactory::new()
            .with_fallback_chain(vec!["broken".to_string(), "missing".to_string()]);
        register_failing(&factory, "primary");
        register_failing(&factory, "broken");

        let err = factory
            .create_engine("primary", &EngineConfig::default(), true, true)
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("primary:"));
        assert!(message.contains("broken:"));
        assert!(message.contains("missing: not registered"));
    }

    #[tokio::test]
    async fn register_replaces_existing_entry() {
        let factory = EngineFactory::new();
        register_failing(&factory, "mock");
        register_mock(&factory, "mock");

        let instance = factory
            .create_engine("mock", &EngineConfig::default(), false, false)
            .await
            .unwrap();
        assert_eq!(instance.name(), "mock");
    }

    #[test]
    fn fingerprint_is_deterministic_per_content() {
        let config = EngineConfig::default();
        assert_eq!(fingerprint("mock", &config), fingerprint("mock", &config.clone()));
        assert_ne!(fingerprint("mock", &config), fingerprint("other", &config));

        let changed = EngineConfig {
            timeout_secs: 5,
            ..Default::default()
        };
        assert_ne!(fingerprint("mock", &config), fingerprint("mock", &changed));
    }

    #[test]
    fn rescan_replaces_manual_registrations_with_builtins() {
        let factory = EngineFactory::new();
        register_mock(&factory, "mock");
        assert_eq!(factory.get_available_engines(), vec!["mock".to_string()]);

        factory.rescan();
        let engines = factory.get_available_engines();
        assert!(!engines.contains(&"mock".to_string()));
        // Probes for the default-deployment sidecars always succeed.
        assert!(engines.contains(&"tesseract".to_string()));
        assert!(engines.contains(&"paddleocr".to_string()));
    }
}

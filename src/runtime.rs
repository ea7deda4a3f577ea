use std::sync::Arc;

use crate::collections::Collections;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::facts::aggregator::FactCache;
use crate::facts::FactStore;
use crate::inbox::Inbox;
use crate::maintenance::MaintenanceScanner;
use crate::proposals::ReflectionStore;
use crate::reconciler::Reconciler;
use crate::store::KvStore;

/// Everything the app needs, wired over one substrate.
pub struct EngineRuntime {
    pub config: EngineConfig,
    pub cache: Arc<FactCache>,
    pub facts: Arc<FactStore>,
    pub collections: Arc<Collections>,
    pub reflections: Arc<ReflectionStore>,
    pub reconciler: Arc<Reconciler>,
    pub inbox: Inbox,
    pub scanner: MaintenanceScanner,
}

impl EngineRuntime {
    pub fn bootstrap(config: EngineConfig, store: Arc<dyn KvStore>) -> Self {
        let cache = Arc::new(FactCache::new());
        let facts = Arc::new(FactStore::new(Arc::clone(&store), Arc::clone(&cache)));
        let collections = Arc::new(Collections::new(Arc::clone(&store)));
        let reflections = Arc::new(ReflectionStore::new(Arc::clone(&store)));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&facts),
            Arc::clone(&collections),
            Arc::clone(&reflections),
        ));
        let inbox = Inbox::new(
            Arc::clone(&reflections),
            Arc::clone(&reconciler),
            config.date_bucket_week_days,
        );
        let scanner = MaintenanceScanner::new(Arc::clone(&facts), Arc::clone(&collections));
        Self {
            config,
            cache,
            facts,
            collections,
            reflections,
            reconciler,
            inbox,
            scanner,
        }
    }

    /// Warm the read-side cache. Callers render a loading state until this
    /// resolves; it never blocks first paint.
    pub async fn warm_cache(&self) -> Result<()> {
        self.cache.refresh(&self.facts).await
    }
}

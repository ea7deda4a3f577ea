use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use reverie::config::EngineConfig;
use reverie::maintenance::exact_match_similarity;
use reverie::runtime::EngineRuntime;
use reverie::store::SqliteKvStore;

/// Maintenance sweep: report orphaned and near-duplicate facts so the
/// reviewer can clean them up from the app.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,reverie=debug")),
        )
        .init();

    let config = EngineConfig::load();
    let database_path = config.database_path();
    if let Some(parent) = database_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating data dir {}", parent.display()))?;
    }
    let store = SqliteKvStore::open(&database_path)
        .with_context(|| format!("opening {}", database_path.display()))?;

    let rt = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    rt.block_on(async {
        let runtime = EngineRuntime::bootstrap(config, Arc::new(store));
        runtime.warm_cache().await?;

        let orphans = runtime.scanner.find_orphans().await?;
        let duplicates = runtime
            .scanner
            .find_duplicates(
                &exact_match_similarity,
                runtime.config.duplicate_similarity_threshold,
            )
            .await?;

        tracing::info!(
            facts = runtime.cache.snapshot().await.map(|f| f.len()).unwrap_or(0),
            orphans = orphans.len(),
            duplicates = duplicates.len(),
            "maintenance sweep complete"
        );
        for fact in &orphans {
            tracing::info!(fact_id = %fact.id, content = %fact.content, "orphaned fact");
        }
        for pair in &duplicates {
            tracing::info!(
                first = %pair.first.id,
                second = %pair.second.id,
                score = pair.score,
                "duplicate candidates"
            );
        }
        Ok::<_, anyhow::Error>(())
    })?;
    Ok(())
}

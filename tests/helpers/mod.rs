//! Shared fixtures for the end-to-end suites: throwaway memory roots and
//! central repos built in temp dirs, plus engine/sync constructors wired the
//! way the daemon wires them.

use std::path::Path;
use std::sync::Arc;

use minimem::config::SyncConfig;
use minimem::{EngineConfig, MemoryEngine, SyncContext};

pub fn write(base: &Path, rel: &str, contents: &str) {
    let path = base.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

pub fn read(base: &Path, rel: &str) -> String {
    std::fs::read_to_string(base.join(rel)).unwrap()
}

pub async fn open_engine(
    root: &Path,
    provider: Arc<dyn minimem::EmbeddingProvider>,
) -> MemoryEngine {
    let config = EngineConfig::builder(root).build().unwrap();
    MemoryEngine::open(config, provider).await.unwrap()
}

/// Sync context for a root mapped at `central_path` under `central`, as one
/// machine.
pub fn sync_context(root: &Path, central: &Path, central_path: &str, machine_id: &str) -> SyncContext {
    let config = EngineConfig::builder(root)
        .sync(SyncConfig {
            enabled: true,
            central_path: Some(central_path.to_string()),
            ..SyncConfig::default()
        })
        .build()
        .unwrap();
    SyncContext::from_config(&config, central, machine_id).unwrap()
}

use std::path::Path;
use std::sync::Once;

use kappa_store::config::{BufferPoolSpec, EngineConfig, VolumeOpenMode, VolumeSpec};
use kappa_store::Engine;

static INIT: Once = Once::new();

pub fn init_log() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub fn config(dir: &Path) -> EngineConfig {
    EngineConfig {
        volumes: vec![VolumeSpec {
            name: "main".to_string(),
            path: dir.join("main.vol"),
            create: VolumeOpenMode::Create,
            page_size: 4096,
            initial_pages: 4,
            extension_pages: 4,
            maximum_pages: 65536,
        }],
        buffer_pools: vec![BufferPoolSpec { page_size: 4096, frame_count: 64 }],
        journal_path: dir.join("journal"),
        poll_interval_ms: None,
        ..EngineConfig::default()
    }
}

pub fn test_engine(dir: &Path) -> Engine {
    init_log();
    Engine::open(config(dir)).unwrap()
}

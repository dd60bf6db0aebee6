// src/agent/mod.rs

pub mod config;     // Environment-driven daemon configuration
pub mod server;     // gRPC services and router assembly
pub mod sys;        // Root backends and security-context retrieval

use std::path::Path;
use std::sync::Arc;

use config::AgentConfig;
use sys::ksu::KsuBackend;
use sys::magisk::MagiskBackend;
use sys::traits::ModuleBackend;

// Dropped by the KernelSU installer; its presence marks a ksud device.
const KSUD_PROBE: &str = "/data/adb/ksud";

/// Picks the root backend: explicit override first, ksud probe otherwise.
pub fn select_backend(config: &AgentConfig) -> Arc<dyn ModuleBackend> {
    let ksu = match config.platform_override.as_deref() {
        Some("kernelsu") => true,
        Some("magisk") => false,
        Some(other) => {
            tracing::warn!("unknown ROOTMOD_PLATFORM '{}', probing instead", other);
            Path::new(KSUD_PROBE).exists()
        }
        None => Path::new(KSUD_PROBE).exists(),
    };

    if ksu {
        Arc::new(KsuBackend::new(&config.modules_dir))
    } else {
        Arc::new(MagiskBackend::new(&config.modules_dir))
    }
}

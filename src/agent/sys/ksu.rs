// src/agent/sys/ksu.rs

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;

use crate::agent::sys::magisk::scan_modules;
use crate::agent::sys::traits::{validate_module_id, ModuleBackend};
use crate::model::{LocalModule, ModuleState, Platform};

/// Backend driving `ksud`. Discovery reads the same on-disk module tree as
/// the marker-file backend; mutations go through the ksud CLI because the
/// kernel side owns the staging there. This is the exclusive backend kind:
/// a staged removal cannot be reversed.
pub struct KsuBackend {
    modules_dir: PathBuf,
    ksud_bin: String,
}

impl KsuBackend {
    pub fn new(modules_dir: impl Into<PathBuf>) -> Self {
        Self {
            modules_dir: modules_dir.into(),
            ksud_bin: "ksud".to_string(),
        }
    }

    async fn run_ksud(&self, args: &[&str]) -> Result<(), String> {
        let output = Command::new(&self.ksud_bin)
            .args(args)
            .output()
            .await
            .map_err(|e| format!("failed to spawn {}: {}", self.ksud_bin, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "{} {} failed: {}",
                self.ksud_bin,
                args.join(" "),
                stderr.trim()
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ModuleBackend for KsuBackend {
    fn kind(&self) -> Platform {
        Platform::KernelSu
    }

    async fn list(&self) -> Result<Vec<LocalModule>, String> {
        scan_modules(&self.modules_dir).await
    }

    async fn get(&self, id: &str) -> Result<LocalModule, String> {
        validate_module_id(id)?;
        let modules = scan_modules(&self.modules_dir).await?;
        modules
            .into_iter()
            .find(|m| m.id == id)
            .ok_or_else(|| format!("module '{}' is not installed", id))
    }

    async fn enable(&self, id: &str) -> Result<(), String> {
        let module = self.get(id).await?;
        if module.state == ModuleState::Remove {
            // ksud has no un-remove; the staged removal stands until the
            // next apply cycle.
            return Err(format!(
                "module '{}': staged removal cannot be reversed on KernelSU",
                id
            ));
        }
        self.run_ksud(&["module", "enable", id]).await
    }

    async fn disable(&self, id: &str) -> Result<(), String> {
        self.get(id).await?;
        self.run_ksud(&["module", "disable", id]).await
    }

    async fn remove(&self, id: &str) -> Result<(), String> {
        self.get(id).await?;
        self.run_ksud(&["module", "uninstall", id]).await
    }
}

// src/agent/sys/magisk.rs

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;

use crate::agent::sys::traits::{validate_module_id, ModuleBackend};
use crate::model::{LocalModule, ModuleState, Platform};

pub const PROP_FILE: &str = "module.prop";
pub const DISABLE_MARKER: &str = "disable";
pub const REMOVE_MARKER: &str = "remove";
pub const UPDATE_MARKER: &str = "update";

/// Marker-file backend. A module is a directory under `modules_dir` carrying
/// a `module.prop`; its staged state is derived from empty marker files next
/// to it, applied by the boot chain on the next restart.
pub struct MagiskBackend {
    modules_dir: PathBuf,
}

impl MagiskBackend {
    pub fn new(modules_dir: impl Into<PathBuf>) -> Self {
        Self {
            modules_dir: modules_dir.into(),
        }
    }

    fn module_dir(&self, id: &str) -> Result<PathBuf, String> {
        validate_module_id(id)?;
        let dir = self.modules_dir.join(id);
        Ok(dir)
    }

    async fn existing_module_dir(&self, id: &str) -> Result<PathBuf, String> {
        let dir = self.module_dir(id)?;
        if !fs::try_exists(dir.join(PROP_FILE)).await.unwrap_or(false) {
            return Err(format!("module '{}' is not installed", id));
        }
        Ok(dir)
    }
}

#[async_trait]
impl ModuleBackend for MagiskBackend {
    fn kind(&self) -> Platform {
        Platform::Magisk
    }

    async fn list(&self) -> Result<Vec<LocalModule>, String> {
        scan_modules(&self.modules_dir).await
    }

    async fn get(&self, id: &str) -> Result<LocalModule, String> {
        let dir = self.existing_module_dir(id).await?;
        read_module(&dir).await
    }

    async fn enable(&self, id: &str) -> Result<(), String> {
        let dir = self.existing_module_dir(id).await?;
        remove_marker(&dir, DISABLE_MARKER).await?;
        remove_marker(&dir, REMOVE_MARKER).await
    }

    async fn disable(&self, id: &str) -> Result<(), String> {
        let dir = self.existing_module_dir(id).await?;
        write_marker(&dir, DISABLE_MARKER).await
    }

    async fn remove(&self, id: &str) -> Result<(), String> {
        let dir = self.existing_module_dir(id).await?;
        write_marker(&dir, REMOVE_MARKER).await
    }
}

// ==============================================================================
// Shared module discovery (also used by the ksud backend)
// ==============================================================================

pub(crate) async fn scan_modules(modules_dir: &Path) -> Result<Vec<LocalModule>, String> {
    let mut entries = match fs::read_dir(modules_dir).await {
        Ok(entries) => entries,
        // A device with no modules installed has no directory yet.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(format!("read {}: {}", modules_dir.display(), e)),
    };

    let mut modules = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| format!("read {}: {}", modules_dir.display(), e))?
    {
        let dir = entry.path();
        if !fs::try_exists(dir.join(PROP_FILE)).await.unwrap_or(false) {
            continue;
        }
        match read_module(&dir).await {
            Ok(module) => modules.push(module),
            Err(e) => tracing::warn!("skipping {}: {}", dir.display(), e),
        }
    }

    modules.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(modules)
}

pub(crate) async fn read_module(dir: &Path) -> Result<LocalModule, String> {
    let prop_path = dir.join(PROP_FILE);
    let raw = fs::read_to_string(&prop_path)
        .await
        .map_err(|e| format!("read {}: {}", prop_path.display(), e))?;

    let mut module = parse_prop(&raw)?;
    module.state = read_state(dir).await;
    module.last_updated = mtime_millis(&prop_path).await;
    Ok(module)
}

pub(crate) async fn read_state(dir: &Path) -> ModuleState {
    // Removal staging wins over everything else the boot chain might see.
    if fs::try_exists(dir.join(REMOVE_MARKER)).await.unwrap_or(false) {
        ModuleState::Remove
    } else if fs::try_exists(dir.join(DISABLE_MARKER)).await.unwrap_or(false) {
        ModuleState::Disable
    } else if fs::try_exists(dir.join(UPDATE_MARKER)).await.unwrap_or(false) {
        ModuleState::Update
    } else {
        ModuleState::Enable
    }
}

/// Parses the key=value `module.prop` format. Only `id` is mandatory;
/// everything else degrades to an empty field.
pub(crate) fn parse_prop(raw: &str) -> Result<LocalModule, String> {
    let mut module = LocalModule {
        id: String::new(),
        name: String::new(),
        version: String::new(),
        version_code: -1,
        author: String::new(),
        description: String::new(),
        update_json: String::new(),
        state: ModuleState::Enable,
        last_updated: 0,
    };

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "id" => module.id = value.to_string(),
            "name" => module.name = value.to_string(),
            "version" => module.version = value.to_string(),
            "versionCode" => module.version_code = value.parse().unwrap_or(-1),
            "author" => module.author = value.to_string(),
            "description" => module.description = value.to_string(),
            "updateJson" => module.update_json = value.to_string(),
            _ => {}
        }
    }

    if module.id.is_empty() {
        return Err("module.prop has no id".to_string());
    }
    Ok(module)
}

async fn mtime_millis(path: &Path) -> i64 {
    let Ok(meta) = fs::metadata(path).await else {
        return 0;
    };
    meta.modified()
        .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
        .unwrap_or(0)
}

async fn write_marker(dir: &Path, marker: &str) -> Result<(), String> {
    let path = dir.join(marker);
    fs::write(&path, b"")
        .await
        .map_err(|e| format!("write {}: {}", path.display(), e))
}

async fn remove_marker(dir: &Path, marker: &str) -> Result<(), String> {
    let path = dir.join(marker);
    match fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(format!("remove {}: {}", path.display(), e)),
    }
}

// src/model.rs

use serde::Deserialize;

use crate::pb;

/// Lifecycle stance of an installed module relative to the next apply cycle.
/// `Remove` and `Update` are staged states: the module's data is still on
/// disk until a reboot-style apply step runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleState {
    Enable,
    Disable,
    Remove,
    Update,
}

/// Which root backend the daemon is driving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Magisk,
    KernelSu,
}

impl Platform {
    /// The exclusive backend kind cannot reverse a staged removal.
    pub fn is_exclusive(self) -> bool {
        matches!(self, Platform::KernelSu)
    }
}

/// Authoritative record of one installed module, keyed by its opaque id.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalModule {
    pub id: String,
    pub name: String,
    pub version: String,
    pub version_code: i64,
    pub author: String,
    pub description: String,
    /// URL of the module's self-published update manifest; empty if none.
    pub update_json: String,
    pub state: ModuleState,
    /// Epoch milliseconds of the module's last on-disk change.
    pub last_updated: i64,
}

/// Remote version descriptor consumed by the update surface.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionItem {
    pub version: String,
    pub version_code: i64,
    pub zip_url: String,
    pub changelog: String,
}

impl VersionItem {
    pub fn version_display(&self) -> String {
        format!("{} ({})", self.version, self.version_code)
    }
}

/// Serde model of a module's self-published update manifest.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateJson {
    pub version: String,
    pub version_code: i64,
    pub zip_url: String,
    #[serde(default)]
    pub changelog: String,
}

impl UpdateJson {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn into_version_item(self) -> VersionItem {
        VersionItem {
            version: self.version,
            version_code: self.version_code,
            zip_url: self.zip_url,
            changelog: self.changelog,
        }
    }
}

/// A privileged state transition requested for one module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Enable,
    Disable,
    Remove,
}

/// Terminal result of an accepted operation. Delivered exactly once per
/// accepted request, on an unspecified task.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationResult {
    Success { id: String },
    Failure { id: String, message: Option<String> },
}

impl OperationResult {
    pub fn id(&self) -> &str {
        match self {
            OperationResult::Success { id } => id,
            OperationResult::Failure { id, .. } => id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, OperationResult::Success { .. })
    }
}

impl From<ModuleState> for pb::ModuleState {
    fn from(state: ModuleState) -> Self {
        match state {
            ModuleState::Enable => pb::ModuleState::Enable,
            ModuleState::Disable => pb::ModuleState::Disable,
            ModuleState::Remove => pb::ModuleState::Remove,
            ModuleState::Update => pb::ModuleState::Update,
        }
    }
}

impl From<pb::ModuleState> for ModuleState {
    fn from(state: pb::ModuleState) -> Self {
        match state {
            pb::ModuleState::Disable => ModuleState::Disable,
            pb::ModuleState::Remove => ModuleState::Remove,
            pb::ModuleState::Update => ModuleState::Update,
            // An unspecified state means the daemon found no marker files.
            pb::ModuleState::Enable | pb::ModuleState::Unspecified => ModuleState::Enable,
        }
    }
}

impl From<Platform> for pb::Platform {
    fn from(platform: Platform) -> Self {
        match platform {
            Platform::Magisk => pb::Platform::Magisk,
            Platform::KernelSu => pb::Platform::Kernelsu,
        }
    }
}

impl TryFrom<pb::Platform> for Platform {
    type Error = String;

    fn try_from(platform: pb::Platform) -> Result<Self, Self::Error> {
        match platform {
            pb::Platform::Magisk => Ok(Platform::Magisk),
            pb::Platform::Kernelsu => Ok(Platform::KernelSu),
            pb::Platform::Unspecified => Err("daemon reported no platform".into()),
        }
    }
}

impl From<LocalModule> for pb::ModuleInfo {
    fn from(m: LocalModule) -> Self {
        pb::ModuleInfo {
            state: pb::ModuleState::from(m.state) as i32,
            id: m.id,
            name: m.name,
            version: m.version,
            version_code: m.version_code,
            author: m.author,
            description: m.description,
            update_json: m.update_json,
            last_updated: m.last_updated,
        }
    }
}

impl From<pb::ModuleInfo> for LocalModule {
    fn from(m: pb::ModuleInfo) -> Self {
        let state = m.state().into();
        LocalModule {
            id: m.id,
            name: m.name,
            version: m.version,
            version_code: m.version_code,
            author: m.author,
            description: m.description,
            update_json: m.update_json,
            state,
            last_updated: m.last_updated,
        }
    }
}

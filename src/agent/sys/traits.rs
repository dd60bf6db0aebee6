// src/agent/sys/traits.rs

use async_trait::async_trait;

use crate::model::{LocalModule, Platform};

// ==============================================================================
// Root backend contract
// ==============================================================================

/// Contract every root backend fulfills. Errors at this seam are plain
/// strings; the service layer folds them into reply payloads.
#[async_trait]
pub trait ModuleBackend: Send + Sync {
    fn kind(&self) -> Platform;

    /// Enumerates every installed module together with its staged state.
    async fn list(&self) -> Result<Vec<LocalModule>, String>;

    /// Reads one module's record. Unknown ids are errors, not empty records.
    async fn get(&self, id: &str) -> Result<LocalModule, String>;

    async fn enable(&self, id: &str) -> Result<(), String>;

    async fn disable(&self, id: &str) -> Result<(), String>;

    /// Stages the module for removal at the next apply cycle. Data stays on
    /// disk until then.
    async fn remove(&self, id: &str) -> Result<(), String>;
}

/// Module ids become path segments and subprocess arguments; anything
/// outside this set is refused before it reaches either.
pub fn validate_module_id(id: &str) -> Result<(), String> {
    if id.is_empty()
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(format!("invalid module id '{}'", id));
    }
    Ok(())
}

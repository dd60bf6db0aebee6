// src/repo.rs

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::model::{LocalModule, UpdateJson, VersionItem};

/// The authoritative-record collaborator. The provider refreshes records
/// into it after successful operations; repository mirrors feed it the
/// newest advertised version per module. Embedders with their own
/// persistence implement this; `MemoryStore` covers everyone else.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn upsert(&self, module: LocalModule);

    /// Replaces the full record set, keeping repository metadata.
    async fn replace_all(&self, modules: Vec<LocalModule>);

    async fn get(&self, id: &str) -> Option<LocalModule>;

    async fn all(&self) -> Vec<LocalModule>;

    /// Registers (or clears, with `None`) the newest version a repository
    /// mirror advertises for the module.
    async fn set_repo_version(&self, id: &str, item: Option<VersionItem>);

    /// True while a repository mirror advertises any version for the id.
    async fn has_updatable_tag(&self, id: &str) -> bool;

    async fn version_of(&self, id: &str) -> Option<VersionItem>;
}

#[derive(Default)]
pub struct MemoryStore {
    modules: Mutex<HashMap<String, LocalModule>>,
    repo_versions: Mutex<HashMap<String, VersionItem>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn upsert(&self, module: LocalModule) {
        self.modules
            .lock()
            .unwrap()
            .insert(module.id.clone(), module);
    }

    async fn replace_all(&self, modules: Vec<LocalModule>) {
        let mut slot = self.modules.lock().unwrap();
        slot.clear();
        for module in modules {
            slot.insert(module.id.clone(), module);
        }
    }

    async fn get(&self, id: &str) -> Option<LocalModule> {
        self.modules.lock().unwrap().get(id).cloned()
    }

    async fn all(&self) -> Vec<LocalModule> {
        let mut modules: Vec<_> = self.modules.lock().unwrap().values().cloned().collect();
        modules.sort_by(|a, b| a.id.cmp(&b.id));
        modules
    }

    async fn set_repo_version(&self, id: &str, item: Option<VersionItem>) {
        let mut versions = self.repo_versions.lock().unwrap();
        match item {
            Some(item) => {
                versions.insert(id.to_string(), item);
            }
            None => {
                versions.remove(id);
            }
        }
    }

    async fn has_updatable_tag(&self, id: &str) -> bool {
        self.repo_versions.lock().unwrap().contains_key(id)
    }

    async fn version_of(&self, id: &str) -> Option<VersionItem> {
        self.repo_versions.lock().unwrap().get(id).cloned()
    }
}

/// Fetches a module's self-published update manifest. The transport lives
/// with the embedder; the default fetcher reports nothing.
#[async_trait]
pub trait UpdateFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Option<UpdateJson>;
}

pub struct NoUpdates;

#[async_trait]
impl UpdateFetcher for NoUpdates {
    async fn fetch(&self, _url: &str) -> Option<UpdateJson> {
        None
    }
}

/// View-level cache mapping module id to its remote version descriptor.
/// Populated lazily, invalidated whenever the updatable tag disappears;
/// negative lookups are cached too, so one miss does not become a fetch
/// per render.
pub struct VersionCache {
    store: Arc<dyn LocalStore>,
    fetcher: Arc<dyn UpdateFetcher>,
    cache: Mutex<HashMap<String, Option<VersionItem>>>,
}

impl VersionCache {
    pub fn new(store: Arc<dyn LocalStore>, fetcher: Arc<dyn UpdateFetcher>) -> Self {
        Self {
            store,
            fetcher,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, module: &LocalModule) -> Option<VersionItem> {
        if !self.store.has_updatable_tag(&module.id).await {
            self.cache.lock().unwrap().remove(&module.id);
            return None;
        }

        if let Some(cached) = self.cache.lock().unwrap().get(&module.id) {
            return cached.clone();
        }

        // A module-published manifest outranks whatever the mirrors carry.
        let item = if !module.update_json.is_empty() {
            self.fetcher
                .fetch(&module.update_json)
                .await
                .map(UpdateJson::into_version_item)
        } else {
            self.store.version_of(&module.id).await
        };

        self.cache
            .lock()
            .unwrap()
            .insert(module.id.clone(), item.clone());
        item
    }
}

// src/download.rs

use regex::Regex;

use crate::model::{LocalModule, VersionItem};

/// Descriptor handed to the external download subsystem. The key doubles
/// as the progress lookup handle.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskItem {
    pub key: String,
    pub url: String,
    pub filename: String,
    pub title: String,
    pub desc: String,
}

/// Progress surface the download subsystem reports back through.
pub trait DownloadListener: Send + Sync {
    fn on_progress(&self, value: f32);
    fn on_success(&self);
    fn on_failure(&self, message: &str);
}

/// `<name>_<version>_<code>.zip` with whitespace and path separators
/// collapsed into underscores.
pub fn filename_for(name: &str, version: &str, version_code: i64) -> String {
    let scrub = Regex::new(r"[\s/]+").unwrap();
    format!(
        "{}_{}_{}.zip",
        scrub.replace_all(name, "_"),
        scrub.replace_all(version, "_"),
        version_code
    )
}

/// Builds the download descriptor for one module version.
pub fn task_for(module: &LocalModule, item: &VersionItem) -> TaskItem {
    TaskItem {
        key: item.version_display(),
        url: item.zip_url.clone(),
        filename: filename_for(&module.name, &item.version, item.version_code),
        title: module.name.clone(),
        desc: item.version_display(),
    }
}

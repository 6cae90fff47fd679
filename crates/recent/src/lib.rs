use std::{
    collections::HashMap,
    fs, io,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const STORAGE_KEY: &str = "checklist-recent";
pub const MAX_RECENT: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecentChecklist {
    pub id: String,
    pub title: String,
    pub url: String,
    pub last_visited: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_count: Option<u32>,
}

/// A visit to record; the cache stamps `last_visited` itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentVisit {
    pub id: String,
    pub title: String,
    pub url: String,
}

/// Device-local string key/value storage.
pub trait LocalStorage: Send + Sync {
    fn get_item(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn set_item(&self, key: &str, value: &str) -> anyhow::Result<()>;
    fn remove_item(&self, key: &str) -> anyhow::Result<()>;
}

/// One `<key>.json` file per key.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn default_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("checklist")
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl LocalStorage for FileStorage {
    fn get_item(&self, key: &str) -> anyhow::Result<Option<String>> {
        let path = self.path(key);
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.path(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> anyhow::Result<()> {
        let path = self.path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    fn items(&self) -> anyhow::Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.items
            .lock()
            .map_err(|_| anyhow::anyhow!("memory storage mutex poisoned"))
    }
}

impl LocalStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.items()?.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.items()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> anyhow::Result<()> {
        self.items()?.remove(key);
        Ok(())
    }
}

/// Bounded, most-recent-first list of visited checklists.
///
/// Best effort: storage failures are logged and every operation falls back to
/// an empty list or a no-op. A cache built with [`RecencyCache::disabled`]
/// never touches storage at all.
pub struct RecencyCache {
    storage: Option<Arc<dyn LocalStorage>>,
    // serializes read-modify-write cycles within this instance
    guard: Mutex<()>,
}

impl RecencyCache {
    pub fn new(storage: Arc<dyn LocalStorage>) -> Self {
        Self {
            storage: Some(storage),
            guard: Mutex::new(()),
        }
    }

    pub fn disabled() -> Self {
        Self {
            storage: None,
            guard: Mutex::new(()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.storage.is_some()
    }

    pub fn list(&self) -> Vec<RecentChecklist> {
        match &self.storage {
            Some(storage) => load(storage.as_ref()),
            None => Vec::new(),
        }
    }

    pub fn touch(&self, visit: RecentVisit) {
        self.touch_at(visit, Utc::now());
    }

    pub fn touch_at(&self, visit: RecentVisit, now: DateTime<Utc>) {
        self.mutate("touch", |entries| {
            let mut updated = Vec::with_capacity(MAX_RECENT);
            updated.push(RecentChecklist {
                id: visit.id.clone(),
                title: visit.title,
                url: visit.url,
                last_visited: now,
                item_count: None,
                completed_count: None,
            });
            updated.extend(entries.into_iter().filter(|e| e.id != visit.id));
            updated.truncate(MAX_RECENT);
            Some(updated)
        });
    }

    pub fn update_stats(&self, id: &str, item_count: u32, completed_count: u32) {
        self.update_stats_at(id, item_count, completed_count, Utc::now());
    }

    pub fn update_stats_at(
        &self,
        id: &str,
        item_count: u32,
        completed_count: u32,
        now: DateTime<Utc>,
    ) {
        self.mutate("update_stats", |mut entries| {
            let entry = entries.iter_mut().find(|e| e.id == id)?;
            entry.item_count = Some(item_count);
            entry.completed_count = Some(completed_count);
            entry.last_visited = now;
            Some(entries)
        });
    }

    pub fn remove(&self, id: &str) {
        self.mutate("remove", |entries| {
            let before = entries.len();
            let kept: Vec<_> = entries.into_iter().filter(|e| e.id != id).collect();
            (kept.len() != before).then_some(kept)
        });
    }

    pub fn clear(&self) {
        let Some(storage) = &self.storage else {
            return;
        };
        let _guard = self.guard.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(err) = storage.remove_item(STORAGE_KEY) {
            warn!(error = %format!("{err:#}"), "failed to clear recent checklists");
        }
    }

    /// `apply` returns `None` when nothing changed and no write is needed.
    fn mutate(
        &self,
        what: &'static str,
        apply: impl FnOnce(Vec<RecentChecklist>) -> Option<Vec<RecentChecklist>>,
    ) {
        let Some(storage) = &self.storage else {
            return;
        };
        let _guard = self.guard.lock().unwrap_or_else(|e| e.into_inner());
        let Some(updated) = apply(load(storage.as_ref())) else {
            debug!(op = what, "recent checklists unchanged");
            return;
        };
        let result = serde_json::to_string(&updated)
            .context("encoding recent checklists")
            .and_then(|raw| storage.set_item(STORAGE_KEY, &raw));
        match result {
            Ok(()) => debug!(op = what, entries = updated.len(), "recent checklists saved"),
            Err(err) => warn!(op = what, error = %format!("{err:#}"), "failed to save recent checklists"),
        }
    }
}

fn load(storage: &dyn LocalStorage) -> Vec<RecentChecklist> {
    match storage.get_item(STORAGE_KEY) {
        Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|err| {
            warn!(error = %err, "recent checklists unparsable; treating as empty");
            Vec::new()
        }),
        Ok(None) => Vec::new(),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "failed to load recent checklists");
            Vec::new()
        }
    }
}

pub fn format_last_visited(last_visited: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let hours = (now - last_visited).num_hours();
    if hours < 1 {
        "Just now".to_string()
    } else if hours < 24 {
        format!("{hours}h ago")
    } else if hours < 24 * 7 {
        format!("{}d ago", hours / 24)
    } else {
        last_visited.format("%Y-%m-%d").to_string()
    }
}

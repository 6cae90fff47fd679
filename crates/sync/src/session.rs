use std::sync::Arc;

use chrono::{DateTime, Utc};
use core_model::{
    Checklist, ChecklistStats, DEFAULT_TITLE, Item, ItemPatch, ShareExport, normalize_item_text,
    normalize_title,
};
use recent::{RecencyCache, RecentVisit};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{connectivity::Connectivity, error::StoreResult, store::ChecklistStore};

/// What a checklist screen renders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionView {
    pub checklist: Option<Checklist>,
    /// Newest first.
    pub items: Vec<Item>,
    /// True until the first checklist and items snapshots have been handled.
    pub loading: bool,
}

impl SessionView {
    pub fn title(&self) -> &str {
        self.checklist
            .as_ref()
            .map(|c| c.title.as_str())
            .unwrap_or(DEFAULT_TITLE)
    }

    pub fn stats(&self) -> ChecklistStats {
        ChecklistStats::from_items(&self.items)
    }

    pub fn item(&self, item_id: &str) -> Option<&Item> {
        self.items.iter().find(|i| i.id == item_id)
    }

    pub fn share_export(&self, now: DateTime<Utc>) -> ShareExport {
        ShareExport::new(self.title(), &self.items, now)
    }
}

/// One open checklist: binds the store's live snapshots to a [`SessionView`]
/// and turns user intents into store calls.
///
/// Opening a checklist that does not exist yet creates it with the default
/// title. Every visit is recorded in the recency cache together with the
/// latest progress counts.
pub struct ChecklistSession {
    id: String,
    url: String,
    store: ChecklistStore,
    view: watch::Receiver<SessionView>,
    binder: JoinHandle<()>,
}

impl ChecklistSession {
    pub fn open(store: ChecklistStore, recent: Arc<RecencyCache>, id: &str, url: &str) -> Self {
        let (tx, view) = watch::channel(SessionView {
            loading: true,
            ..SessionView::default()
        });
        let binder = tokio::spawn(bind(
            store.clone(),
            recent,
            id.to_string(),
            url.to_string(),
            tx,
        ));
        info!(checklist_id = id, "session opened");
        Self {
            id: id.to_string(),
            url: url.to_string(),
            store,
            view,
            binder,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    pub fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.store.connectivity()
    }

    /// Resolves once both first snapshots have been handled, or with the last
    /// known view if the session was closed first. By then the visit and its
    /// counts are in the recency cache.
    pub async fn wait_until_loaded(&self) -> SessionView {
        let mut rx = self.view.clone();
        if let Ok(view) = rx.wait_for(|v| !v.loading).await {
            return view.clone();
        }
        rx.borrow().clone()
    }

    /// Blank input is ignored and returns `Ok(None)`.
    pub async fn add_item(&self, raw: &str) -> StoreResult<Option<String>> {
        let Some(text) = normalize_item_text(raw) else {
            return Ok(None);
        };
        self.store.add_item(&self.id, &text).await.map(Some)
    }

    /// Flips `completed` relative to the latest snapshot. Returns `false`
    /// without writing when the item is not in the view.
    pub async fn toggle_item(&self, item_id: &str) -> StoreResult<bool> {
        let Some(completed) = self.view.borrow().item(item_id).map(|i| i.completed) else {
            return Ok(false);
        };
        self.store
            .update_item(&self.id, item_id, ItemPatch::completed(!completed))
            .await?;
        Ok(true)
    }

    /// Blank or unchanged text is not written.
    pub async fn edit_item_text(&self, item_id: &str, raw: &str) -> StoreResult<bool> {
        let Some(text) = normalize_item_text(raw) else {
            return Ok(false);
        };
        let unchanged = self
            .view
            .borrow()
            .item(item_id)
            .is_some_and(|i| i.text == text);
        if unchanged {
            return Ok(false);
        }
        self.store
            .update_item(&self.id, item_id, ItemPatch::text(text))
            .await?;
        Ok(true)
    }

    /// Blank becomes the default title; an unchanged title is not written.
    pub async fn rename(&self, raw: &str) -> StoreResult<bool> {
        let title = normalize_title(raw);
        if self.view.borrow().title() == title {
            return Ok(false);
        }
        self.store.update_title(&self.id, &title).await?;
        Ok(true)
    }

    pub async fn delete_item(&self, item_id: &str) -> StoreResult<()> {
        self.store.delete_item(&self.id, item_id).await
    }

    pub async fn clear_completed(&self) -> StoreResult<usize> {
        self.store.clear_completed_items(&self.id).await
    }

    /// Tears down both subscriptions. Idempotent.
    pub fn close(&self) {
        if !self.binder.is_finished() {
            debug!(checklist_id = %self.id, "session closed");
        }
        self.binder.abort();
    }
}

impl Drop for ChecklistSession {
    fn drop(&mut self) {
        self.binder.abort();
    }
}

async fn bind(
    store: ChecklistStore,
    recent: Arc<RecencyCache>,
    id: String,
    url: String,
    view: watch::Sender<SessionView>,
) {
    let mut checklist_rx = store.watch_checklist(&id);
    let mut items_rx = store.watch_items(&id);
    let mut checklist_seen = false;
    let mut items_loaded = false;
    loop {
        tokio::select! {
            Some(snapshot) = checklist_rx.next() => {
                let snapshot = match snapshot {
                    Some(checklist) => Some(checklist),
                    None => match create_if_missing(&store, &id).await {
                        // the create's own snapshot follows on this feed
                        Lookup::Created => continue,
                        Lookup::Exists(checklist) => Some(checklist),
                        Lookup::Failed => None,
                    },
                };
                if let Some(checklist) = &snapshot {
                    store.connectivity_tracker().mark_online();
                    let visit = RecentVisit {
                        id: id.clone(),
                        title: checklist.title.clone(),
                        url: url.clone(),
                    };
                    // touch resets the counts of the entry
                    let stats = items_loaded.then(|| view.borrow().stats());
                    let entry_id = id.clone();
                    record(&recent, move |recent| {
                        recent.touch(visit);
                        if let Some(stats) = stats {
                            recent.update_stats(&entry_id, stats.item_count, stats.completed_count);
                        }
                    })
                    .await;
                }
                checklist_seen = true;
                view.send_modify(|v| {
                    v.checklist = snapshot;
                    v.loading = !items_loaded;
                });
            }
            Some(items) = items_rx.next() => {
                let stats = ChecklistStats::from_items(&items);
                let entry_id = id.clone();
                record(&recent, move |recent| {
                    recent.update_stats(&entry_id, stats.item_count, stats.completed_count);
                })
                .await;
                items_loaded = true;
                view.send_modify(|v| {
                    v.items = items;
                    v.loading = !checklist_seen;
                });
            }
            else => break,
        }
    }
}

/// Runs a recency cache update on the blocking pool; the cache persists
/// through synchronous storage.
async fn record(
    recent: &Arc<RecencyCache>,
    update: impl FnOnce(&RecencyCache) + Send + 'static,
) {
    let recent = recent.clone();
    if let Err(err) = tokio::task::spawn_blocking(move || update(&recent)).await {
        warn!(error = %err, "recency update task failed");
    }
}

enum Lookup {
    Created,
    Exists(Checklist),
    Failed,
}

async fn create_if_missing(store: &ChecklistStore, id: &str) -> Lookup {
    // an absent snapshot may also be a failed read; only create on a clean miss
    match store.get_checklist(id).await {
        Ok(None) => match store.create_checklist(id, Some(DEFAULT_TITLE)).await {
            Ok(()) => Lookup::Created,
            Err(err) => {
                warn!(checklist_id = id, error = %err, "failed to create checklist");
                Lookup::Failed
            }
        },
        Ok(Some(checklist)) => Lookup::Exists(checklist),
        Err(err) => {
            warn!(checklist_id = id, error = %err, "checklist lookup failed");
            Lookup::Failed
        }
    }
}

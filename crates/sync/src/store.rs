use std::sync::Arc;

use core_model::{
    ChangeKind, Checklist, DocumentBackend, Item, ItemPatch, WriteBatch, WriteOp, next_order,
    normalize_title,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    clock::MonotonicClock,
    connectivity::{Connectivity, ConnectivityTracker},
    error::{StoreError, StoreResult},
    subscription::{Snapshots, Subscription},
};

/// Async CRUD and live snapshots over one shared [`DocumentBackend`].
///
/// Each connected client owns one store; any number of stores may share a
/// backend. An item write and the checklist `updated_at` bump it implies are
/// committed as one atomic batch. The max-order read in [`add_item`] is not
/// part of that batch, so concurrent appends may tie on `order`.
///
/// [`add_item`]: ChecklistStore::add_item
#[derive(Clone)]
pub struct ChecklistStore {
    backend: Arc<dyn DocumentBackend>,
    clock: Arc<MonotonicClock>,
    connectivity: Arc<ConnectivityTracker>,
}

impl ChecklistStore {
    pub fn new(backend: Arc<dyn DocumentBackend>) -> Self {
        Self {
            backend,
            clock: Arc::new(MonotonicClock::default()),
            connectivity: Arc::new(ConnectivityTracker::new()),
        }
    }

    pub fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.connectivity.subscribe()
    }

    pub fn connectivity_tracker(&self) -> &ConnectivityTracker {
        &self.connectivity
    }

    pub async fn create_checklist(&self, id: &str, title: Option<&str>) -> StoreResult<()> {
        let now = self.clock.now();
        let checklist = Checklist {
            id: id.to_string(),
            title: normalize_title(title.unwrap_or_default()),
            created_at: now,
            updated_at: now,
        };
        let mut batch = WriteBatch::new();
        batch.push(WriteOp::SetChecklist(checklist));
        let result = self.commit("create_checklist", batch).await;
        self.track("create_checklist", result)?;
        info!(checklist_id = id, "checklist created");
        Ok(())
    }

    pub async fn get_checklist(&self, id: &str) -> StoreResult<Option<Checklist>> {
        let id = id.to_string();
        self.blocking("get_checklist", move |b| b.get_checklist(&id))
            .await
    }

    pub async fn list_items(&self, id: &str) -> StoreResult<Vec<Item>> {
        let id = id.to_string();
        self.blocking("list_items", move |b| b.list_items(&id)).await
    }

    pub async fn update_title(&self, id: &str, title: &str) -> StoreResult<()> {
        let mut batch = WriteBatch::new();
        batch.push(WriteOp::UpdateChecklist {
            id: id.to_string(),
            title: Some(title.to_string()),
            updated_at: self.clock.now(),
        });
        let result = self.commit("update_title", batch).await;
        self.track("update_title", result)?;
        debug!(checklist_id = id, title, "title updated");
        Ok(())
    }

    /// Appends an item above every existing one and returns its id.
    ///
    /// `text` is stored as given; callers trim and reject blank input.
    pub async fn add_item(&self, id: &str, text: &str) -> StoreResult<String> {
        let result = self.add_item_inner(id, text).await;
        self.track("add_item", result)
    }

    async fn add_item_inner(&self, id: &str, text: &str) -> StoreResult<String> {
        let checklist_id = id.to_string();
        let max = self
            .blocking("add_item", move |b| b.max_item_order(&checklist_id))
            .await?;
        let order = next_order(max);
        let now = self.clock.now();
        let item = Item {
            id: self.backend.allocate_item_id(id),
            text: text.to_string(),
            completed: false,
            order,
            created_at: now,
        };
        let item_id = item.id.clone();
        let mut batch = WriteBatch::new();
        batch
            .push(WriteOp::CreateItem {
                checklist_id: id.to_string(),
                item,
            })
            .touch_checklist(id, now);
        self.commit("add_item", batch).await?;
        debug!(checklist_id = id, item_id = %item_id, order, "item added");
        Ok(item_id)
    }

    pub async fn update_item(&self, id: &str, item_id: &str, patch: ItemPatch) -> StoreResult<()> {
        let mut batch = WriteBatch::new();
        batch
            .push(WriteOp::UpdateItem {
                checklist_id: id.to_string(),
                item_id: item_id.to_string(),
                patch,
            })
            .touch_checklist(id, self.clock.now());
        let result = self.commit("update_item", batch).await;
        self.track("update_item", result)?;
        debug!(checklist_id = id, item_id, "item updated");
        Ok(())
    }

    pub async fn delete_item(&self, id: &str, item_id: &str) -> StoreResult<()> {
        let mut batch = WriteBatch::new();
        batch
            .push(WriteOp::DeleteItem {
                checklist_id: id.to_string(),
                item_id: item_id.to_string(),
            })
            .touch_checklist(id, self.clock.now());
        let result = self.commit("delete_item", batch).await;
        self.track("delete_item", result)?;
        debug!(checklist_id = id, item_id, "item deleted");
        Ok(())
    }

    /// Deletes every completed item in one all-or-nothing batch and returns
    /// how many were removed. Writes nothing when no item is completed.
    pub async fn clear_completed_items(&self, id: &str) -> StoreResult<usize> {
        let result = self.clear_completed_inner(id).await;
        self.track("clear_completed_items", result)
    }

    async fn clear_completed_inner(&self, id: &str) -> StoreResult<usize> {
        let checklist_id = id.to_string();
        let completed = self
            .blocking("clear_completed_items", move |b| {
                b.completed_item_ids(&checklist_id)
            })
            .await?;
        if completed.is_empty() {
            return Ok(0);
        }
        let mut batch = WriteBatch::new();
        for item_id in &completed {
            batch.push(WriteOp::DeleteItem {
                checklist_id: id.to_string(),
                item_id: item_id.clone(),
            });
        }
        batch.touch_checklist(id, self.clock.now());
        self.commit("clear_completed_items", batch).await?;
        info!(checklist_id = id, removed = completed.len(), "completed items cleared");
        Ok(completed.len())
    }

    pub fn watch_checklist(&self, id: &str) -> Snapshots<Option<Checklist>> {
        Snapshots::spawn(
            self.backend.clone(),
            id,
            ChangeKind::Checklist,
            read_checklist,
        )
    }

    pub fn watch_items(&self, id: &str) -> Snapshots<Vec<Item>> {
        Snapshots::spawn(self.backend.clone(), id, ChangeKind::Items, read_items)
    }

    /// `callback` receives the current checklist, then every later version.
    /// `None` means the document does not exist or could not be read.
    pub fn on_checklist_change<F>(&self, id: &str, callback: F) -> Subscription
    where
        F: FnMut(Option<Checklist>) + Send + 'static,
    {
        Subscription::spawn(self.watch_checklist(id), callback)
    }

    /// `callback` receives the full item set, newest first, on every change.
    /// Read failures are delivered as an empty list.
    pub fn on_items_change<F>(&self, id: &str, callback: F) -> Subscription
    where
        F: FnMut(Vec<Item>) + Send + 'static,
    {
        Subscription::spawn(self.watch_items(id), callback)
    }

    async fn commit(&self, op: &'static str, batch: WriteBatch) -> StoreResult<()> {
        self.blocking(op, move |b| b.commit(batch)).await
    }

    async fn blocking<T, F>(&self, op: &'static str, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn DocumentBackend) -> anyhow::Result<T> + Send + 'static,
    {
        let backend = self.backend.clone();
        tokio::task::spawn_blocking(move || f(backend.as_ref()))
            .await
            .map_err(|e| StoreError::storage(op, e))?
            .map_err(|cause| StoreError::storage(op, cause))
    }

    fn track<T>(&self, op: &'static str, result: StoreResult<T>) -> StoreResult<T> {
        match &result {
            Ok(_) => self.connectivity.record_success(),
            Err(err) => {
                warn!(op, error = %err, "direct write failed");
                self.connectivity.record_failure();
            }
        }
        result
    }
}

fn read_checklist(backend: &dyn DocumentBackend, id: &str) -> Option<Checklist> {
    backend.get_checklist(id).unwrap_or_else(|err| {
        warn!(checklist_id = id, error = %format!("{err:#}"), "checklist listener error");
        None
    })
}

fn read_items(backend: &dyn DocumentBackend, id: &str) -> Vec<Item> {
    backend.list_items(id).unwrap_or_else(|err| {
        warn!(checklist_id = id, error = %format!("{err:#}"), "items listener error");
        Vec::new()
    })
}

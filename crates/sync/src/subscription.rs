use std::sync::Arc;

use core_model::{ChangeKind, DocumentBackend};
use tokio::{
    sync::{broadcast::error::RecvError, mpsc},
    task::JoinHandle,
};
use tracing::{debug, warn};

const SNAPSHOT_BUFFER: usize = 32;

/// Reads one full snapshot, logging and degrading backend errors itself.
pub(crate) type Reader<T> = fn(&dyn DocumentBackend, &str) -> T;

/// Live stream of full snapshots for one checklist entity.
///
/// The current state arrives first, then a fresh snapshot after every
/// committed change to that entity, from any client. Dropping the stream or
/// calling [`Snapshots::close`] stops the background pump.
pub struct Snapshots<T> {
    rx: mpsc::Receiver<T>,
    pump: JoinHandle<()>,
    closed: bool,
}

impl<T: Default + Send + 'static> Snapshots<T> {
    pub(crate) fn spawn(
        backend: Arc<dyn DocumentBackend>,
        checklist_id: &str,
        kind: ChangeKind,
        read: Reader<T>,
    ) -> Self {
        // subscribe before the first read so nothing committed in between is missed
        let changes = backend.subscribe();
        let (tx, rx) = mpsc::channel(SNAPSHOT_BUFFER);
        let pump = tokio::spawn(pump(
            backend,
            checklist_id.to_string(),
            kind,
            read,
            changes,
            tx,
        ));
        Self {
            rx,
            pump,
            closed: false,
        }
    }
}

impl<T> Snapshots<T> {
    pub async fn next(&mut self) -> Option<T> {
        if self.closed {
            return None;
        }
        self.rx.recv().await
    }

    /// Idempotent. Snapshots still buffered are discarded.
    pub fn close(&mut self) {
        self.closed = true;
        self.pump.abort();
        self.rx.close();
    }
}

impl<T> Drop for Snapshots<T> {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump<T: Default + Send + 'static>(
    backend: Arc<dyn DocumentBackend>,
    checklist_id: String,
    kind: ChangeKind,
    read: Reader<T>,
    mut changes: tokio::sync::broadcast::Receiver<core_model::Change>,
    tx: mpsc::Sender<T>,
) {
    loop {
        let snapshot = read_snapshot(&backend, &checklist_id, read).await;
        if tx.send(snapshot).await.is_err() {
            return;
        }
        loop {
            match changes.recv().await {
                Ok(change) if change.checklist_id == checklist_id && change.kind == kind => break,
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    debug!(checklist_id = %checklist_id, %kind, missed, "change feed lagged; re-reading");
                    break;
                }
                Err(RecvError::Closed) => return,
            }
        }
    }
}

async fn read_snapshot<T: Default + Send + 'static>(
    backend: &Arc<dyn DocumentBackend>,
    checklist_id: &str,
    read: Reader<T>,
) -> T {
    let backend = backend.clone();
    let id = checklist_id.to_string();
    match tokio::task::spawn_blocking(move || read(backend.as_ref(), &id)).await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!(checklist_id, error = %err, "snapshot read task failed");
            T::default()
        }
    }
}

/// Callback registration over a [`Snapshots`] stream.
///
/// Dropping it or calling [`Subscription::unsubscribe`] stops further
/// callback invocations.
#[must_use = "dropping a Subscription unsubscribes it"]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn spawn<T, F>(mut snapshots: Snapshots<T>, mut callback: F) -> Self
    where
        T: Send + 'static,
        F: FnMut(T) + Send + 'static,
    {
        let task = tokio::spawn(async move {
            while let Some(snapshot) = snapshots.next().await {
                callback(snapshot);
            }
        });
        Self { task }
    }

    /// Idempotent; in-flight writes are unaffected.
    pub fn unsubscribe(&self) {
        self.task.abort();
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

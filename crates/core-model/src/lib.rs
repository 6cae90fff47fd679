use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub const DEFAULT_TITLE: &str = "My Checklist";
pub const ITEM_ID_LEN: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Checklist {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    pub text: String,
    pub completed: bool,
    pub order: i64,
    pub created_at: DateTime<Utc>,
}

/// Partial item update. Fields left as `None` are not touched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemPatch {
    pub text: Option<String>,
    pub completed: Option<bool>,
}

impl ItemPatch {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            completed: None,
        }
    }

    pub fn completed(completed: bool) -> Self {
        Self {
            text: None,
            completed: Some(completed),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.completed.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChecklistStats {
    pub item_count: u32,
    pub completed_count: u32,
}

impl ChecklistStats {
    pub fn from_items(items: &[Item]) -> Self {
        Self {
            item_count: items.len() as u32,
            completed_count: items.iter().filter(|i| i.completed).count() as u32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SharedItem {
    pub text: String,
    pub completed: bool,
}

/// Portable copy of a checklist; `created_at` is the export time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ShareExport {
    pub title: String,
    pub items: Vec<SharedItem>,
    pub created_at: DateTime<Utc>,
}

impl ShareExport {
    pub fn new(title: &str, items: &[Item], now: DateTime<Utc>) -> Self {
        Self {
            title: title.to_string(),
            items: items
                .iter()
                .map(|i| SharedItem {
                    text: i.text.clone(),
                    completed: i.completed,
                })
                .collect(),
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Checklist,
    Items,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Checklist => "checklist",
            ChangeKind::Items => "items",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "checklist" => Some(ChangeKind::Checklist),
            "items" => Some(ChangeKind::Items),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published by a backend after a batch commits, once per touched document set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Change {
    pub checklist_id: String,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Create or overwrite the checklist document.
    SetChecklist(Checklist),
    /// Fails the whole batch when the checklist document does not exist.
    UpdateChecklist {
        id: String,
        title: Option<String>,
        updated_at: DateTime<Utc>,
    },
    CreateItem {
        checklist_id: String,
        item: Item,
    },
    /// Fails the whole batch when the item does not exist.
    UpdateItem {
        checklist_id: String,
        item_id: String,
        patch: ItemPatch,
    },
    DeleteItem {
        checklist_id: String,
        item_id: String,
    },
}

impl WriteOp {
    pub fn checklist_id(&self) -> &str {
        match self {
            WriteOp::SetChecklist(c) => &c.id,
            WriteOp::UpdateChecklist { id, .. } => id,
            WriteOp::CreateItem { checklist_id, .. }
            | WriteOp::UpdateItem { checklist_id, .. }
            | WriteOp::DeleteItem { checklist_id, .. } => checklist_id,
        }
    }

    pub fn change(&self) -> Change {
        let kind = match self {
            WriteOp::SetChecklist(_) | WriteOp::UpdateChecklist { .. } => ChangeKind::Checklist,
            _ => ChangeKind::Items,
        };
        Change {
            checklist_id: self.checklist_id().to_string(),
            kind,
        }
    }
}

/// Ordered list of writes applied all-or-nothing by [`DocumentBackend::commit`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn touch_checklist(&mut self, id: &str, updated_at: DateTime<Utc>) -> &mut Self {
        self.push(WriteOp::UpdateChecklist {
            id: id.to_string(),
            title: None,
            updated_at,
        })
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Distinct changes in first-touched order.
    pub fn changes(&self) -> Vec<Change> {
        let mut out: Vec<Change> = Vec::new();
        for op in &self.ops {
            let change = op.change();
            if !out.contains(&change) {
                out.push(change);
            }
        }
        out
    }
}

/// The managed document database a checklist store talks to.
///
/// Implementations own one checklist document per id and one item
/// sub-collection per checklist, and must publish a [`Change`] to every
/// subscriber after each successful `commit`, including to the writer and to
/// subscribers of other clients attached to the same database.
pub trait DocumentBackend: Send + Sync {
    fn get_checklist(&self, id: &str) -> anyhow::Result<Option<Checklist>>;
    /// Items sorted newest first, see [`sort_newest_first`].
    fn list_items(&self, checklist_id: &str) -> anyhow::Result<Vec<Item>>;
    fn max_item_order(&self, checklist_id: &str) -> anyhow::Result<Option<i64>>;
    fn completed_item_ids(&self, checklist_id: &str) -> anyhow::Result<Vec<String>>;
    fn allocate_item_id(&self, checklist_id: &str) -> String;
    fn commit(&self, batch: WriteBatch) -> anyhow::Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<Change>;
}

/// Display order: `order` descending, ties broken by creation time then id,
/// both descending.
pub fn sort_newest_first(items: &mut [Item]) {
    items.sort_by(|a, b| {
        b.order
            .cmp(&a.order)
            .then_with(|| b.created_at.cmp(&a.created_at))
            .then_with(|| b.id.cmp(&a.id))
    });
}

pub fn next_order(max_order: Option<i64>) -> i64 {
    max_order.map_or(0, |max| max + 1)
}

pub fn normalize_title(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        DEFAULT_TITLE.to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn normalize_item_text(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

pub fn deterministic_id(parts: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[0x1f]);
    }
    hasher.finalize().to_hex().to_string()
}

/// `{base36 millis}-{6 base36 random chars}`, embedded in shareable locators.
pub fn new_checklist_id() -> String {
    new_checklist_id_at(Utc::now())
}

pub fn new_checklist_id_at(now: DateTime<Utc>) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::rng();
    let suffix: String = (0..6)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect();
    let millis = u64::try_from(now.timestamp_millis()).unwrap_or_default();
    format!("{}-{}", to_base36(millis), suffix)
}

pub fn checklist_url(base_url: &str, id: &str) -> String {
    format!("{}/checklist/{}/", base_url.trim_end_matches('/'), id)
}

fn to_base36(mut n: u64) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(ALPHABET[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn item(id: &str, order: i64, created_at: DateTime<Utc>) -> Item {
        Item {
            id: id.to_string(),
            text: id.to_string(),
            completed: false,
            order,
            created_at,
        }
    }

    #[test]
    fn deterministic_id_stable() {
        let id1 = deterministic_id(&["a", "b"]);
        let id2 = deterministic_id(&["a", "b"]);
        assert_eq!(id1, id2);
    }

    #[test]
    fn deterministic_id_order_matters() {
        let id1 = deterministic_id(&["a", "b"]);
        let id2 = deterministic_id(&["b", "a"]);
        assert_ne!(id1, id2);
    }

    #[test]
    fn next_order_starts_at_zero() {
        assert_eq!(next_order(None), 0);
        assert_eq!(next_order(Some(0)), 1);
        assert_eq!(next_order(Some(41)), 42);
    }

    #[test]
    fn sort_breaks_order_ties_by_creation_then_id() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let t1 = t0 + Duration::seconds(1);
        let mut items = vec![
            item("a", 0, t0),
            item("b", 1, t0),
            item("c", 1, t1),
            item("d", 1, t1),
        ];
        sort_newest_first(&mut items);
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["d", "c", "b", "a"]);
    }

    #[test]
    fn titles_and_text_are_trimmed() {
        assert_eq!(normalize_title("  Groceries "), "Groceries");
        assert_eq!(normalize_title("   "), DEFAULT_TITLE);
        assert_eq!(normalize_item_text(" milk\n"), Some("milk".to_string()));
        assert_eq!(normalize_item_text(" \t "), None);
    }

    #[test]
    fn checklist_id_shape() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let id = new_checklist_id_at(now);
        let (ts, suffix) = id.split_once('-').expect("dash separator");
        assert_eq!(u64::from_str_radix(ts, 36).unwrap(), now.timestamp_millis() as u64);
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn batch_changes_are_deduplicated() {
        let now = Utc::now();
        let mut batch = WriteBatch::new();
        batch
            .push(WriteOp::DeleteItem {
                checklist_id: "c1".into(),
                item_id: "i1".into(),
            })
            .push(WriteOp::DeleteItem {
                checklist_id: "c1".into(),
                item_id: "i2".into(),
            })
            .touch_checklist("c1", now);
        let changes = batch.changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].kind, ChangeKind::Items);
        assert_eq!(changes[1].kind, ChangeKind::Checklist);
    }

    #[test]
    fn change_kind_parses_its_own_name() {
        for kind in [ChangeKind::Checklist, ChangeKind::Items] {
            assert_eq!(ChangeKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ChangeKind::parse("members"), None);
    }

    #[test]
    fn stats_count_completed() {
        let now = Utc::now();
        let mut items = vec![item("a", 0, now), item("b", 1, now), item("c", 2, now)];
        items[1].completed = true;
        let stats = ChecklistStats::from_items(&items);
        assert_eq!(stats.item_count, 3);
        assert_eq!(stats.completed_count, 1);
    }

    #[test]
    fn checklist_serializes_camel_case() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let checklist = Checklist {
            id: "abc".into(),
            title: DEFAULT_TITLE.into(),
            created_at: now,
            updated_at: now,
        };
        let value = serde_json::to_value(&checklist).unwrap();
        assert!(value.get("createdAt").is_some());
        assert!(value.get("updatedAt").is_some());
    }

    #[test]
    fn share_export_keeps_text_and_state_only() {
        let now = Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap();
        let mut items = vec![item("milk", 1, now), item("eggs", 0, now)];
        items[0].completed = true;
        let export = ShareExport::new("Groceries", &items, now);
        let value = serde_json::to_value(&export).unwrap();
        assert_eq!(value["title"], "Groceries");
        assert_eq!(value["items"][0]["text"], "milk");
        assert_eq!(value["items"][0]["completed"], true);
        assert!(value["items"][0].get("order").is_none());
        assert!(value.get("createdAt").is_some());
    }

    #[test]
    fn url_joins_base_and_id() {
        assert_eq!(
            checklist_url("https://example.test/", "abc"),
            "https://example.test/checklist/abc/"
        );
    }
}

//! Item store contract and an in-memory implementation.
//!
//! The store is the one place where user edits and server reconciliation
//! meet. Every mutation goes through [`ItemStore::atomically`], which either
//! commits everything the closure did or nothing.

use crate::error::{SyncError, SyncResult};
use groupsync_protocol::{Folder, Item, ItemRef, PendingOperation, ProtocolState};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Typed access to the store inside a transaction.
pub trait StoreTxn {
    /// Per-account protocol state.
    fn protocol_state(&self) -> ProtocolState;
    /// Replaces the protocol state.
    fn set_protocol_state(&mut self, state: ProtocolState);

    /// Looks up a folder.
    fn folder(&self, id: &ItemRef) -> Option<Folder>;
    /// All folders.
    fn folders(&self) -> Vec<Folder>;
    /// Inserts or replaces a folder.
    fn put_folder(&mut self, folder: Folder);
    /// Removes a folder (not its contents).
    fn remove_folder(&mut self, id: &ItemRef) -> Option<Folder>;

    /// Looks up an item.
    fn item(&self, id: &ItemRef) -> Option<Item>;
    /// Items whose folder is `folder`.
    fn items_in_folder(&self, folder: &ItemRef) -> Vec<Item>;
    /// Inserts or replaces an item.
    fn put_item(&mut self, item: Item);
    /// Removes an item.
    fn remove_item(&mut self, id: &ItemRef) -> Option<Item>;

    /// Pending rows in id (dispatch) order.
    fn pending(&self) -> Vec<PendingOperation>;
    /// Looks up a pending row.
    fn pending_op(&self, id: u64) -> Option<PendingOperation>;
    /// Appends a row, assigning the next id. Returns the id.
    fn enqueue_pending(&mut self, op: PendingOperation) -> u64;
    /// Replaces an existing row.
    fn put_pending(&mut self, op: PendingOperation);
    /// Removes a row.
    fn remove_pending(&mut self, id: u64) -> Option<PendingOperation>;
}

/// A transactional item store.
pub trait ItemStore: Send + Sync {
    /// Runs `body` in a transaction: committed on `Ok`, rolled back on
    /// `Err`. `body` must not call back into the same store.
    fn atomically(&self, body: &mut dyn FnMut(&mut dyn StoreTxn) -> SyncResult<()>) -> SyncResult<()>;
}

/// Convenience wrappers over [`ItemStore::atomically`].
pub trait ItemStoreExt: ItemStore {
    /// Runs `body` in a transaction and returns its value.
    fn transaction<T>(&self, body: impl FnOnce(&mut dyn StoreTxn) -> SyncResult<T>) -> SyncResult<T> {
        let mut body = Some(body);
        let mut out = None;
        self.atomically(&mut |txn: &mut dyn StoreTxn| {
            let body = body
                .take()
                .ok_or_else(|| SyncError::store("transaction body ran twice"))?;
            out = Some(body(txn)?);
            Ok(())
        })?;
        out.ok_or_else(|| SyncError::store("transaction produced no value"))
    }

    /// Reads through a transaction that changes nothing.
    fn read<T>(&self, body: impl FnOnce(&dyn StoreTxn) -> T) -> SyncResult<T> {
        self.transaction(|txn: &mut dyn StoreTxn| Ok(body(&*txn)))
    }
}

impl<S: ItemStore + ?Sized> ItemStoreExt for S {}

#[derive(Debug, Clone, Default)]
struct Tables {
    protocol: ProtocolState,
    folders: BTreeMap<ItemRef, Folder>,
    items: BTreeMap<ItemRef, Item>,
    pending: BTreeMap<u64, PendingOperation>,
    next_pending_id: u64,
}

impl StoreTxn for Tables {
    fn protocol_state(&self) -> ProtocolState {
        self.protocol.clone()
    }

    fn set_protocol_state(&mut self, state: ProtocolState) {
        self.protocol = state;
    }

    fn folder(&self, id: &ItemRef) -> Option<Folder> {
        self.folders.get(id).cloned()
    }

    fn folders(&self) -> Vec<Folder> {
        self.folders.values().cloned().collect()
    }

    fn put_folder(&mut self, folder: Folder) {
        self.folders.insert(folder.id.clone(), folder);
    }

    fn remove_folder(&mut self, id: &ItemRef) -> Option<Folder> {
        self.folders.remove(id)
    }

    fn item(&self, id: &ItemRef) -> Option<Item> {
        self.items.get(id).cloned()
    }

    fn items_in_folder(&self, folder: &ItemRef) -> Vec<Item> {
        self.items
            .values()
            .filter(|i| &i.folder == folder)
            .cloned()
            .collect()
    }

    fn put_item(&mut self, item: Item) {
        self.items.insert(item.id.clone(), item);
    }

    fn remove_item(&mut self, id: &ItemRef) -> Option<Item> {
        self.items.remove(id)
    }

    fn pending(&self) -> Vec<PendingOperation> {
        self.pending.values().cloned().collect()
    }

    fn pending_op(&self, id: u64) -> Option<PendingOperation> {
        self.pending.get(&id).cloned()
    }

    fn enqueue_pending(&mut self, mut op: PendingOperation) -> u64 {
        self.next_pending_id += 1;
        op.id = self.next_pending_id;
        self.pending.insert(op.id, op);
        self.next_pending_id
    }

    fn put_pending(&mut self, op: PendingOperation) {
        self.pending.insert(op.id, op);
    }

    fn remove_pending(&mut self, id: u64) -> Option<PendingOperation> {
        self.pending.remove(&id)
    }
}

/// On-disk snapshot layout.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    protocol: ProtocolState,
    folders: Vec<Folder>,
    items: Vec<Item>,
    pending: Vec<PendingOperation>,
    next_pending_id: u64,
}

impl From<&Tables> for Snapshot {
    fn from(t: &Tables) -> Self {
        Self {
            protocol: t.protocol.clone(),
            folders: t.folders.values().cloned().collect(),
            items: t.items.values().cloned().collect(),
            pending: t.pending.values().cloned().collect(),
            next_pending_id: t.next_pending_id,
        }
    }
}

impl From<Snapshot> for Tables {
    fn from(s: Snapshot) -> Self {
        let next_pending_id = s
            .pending
            .iter()
            .map(|p| p.id)
            .max()
            .unwrap_or(0)
            .max(s.next_pending_id);
        Self {
            protocol: s.protocol,
            folders: s.folders.into_iter().map(|f| (f.id.clone(), f)).collect(),
            items: s.items.into_iter().map(|i| (i.id.clone(), i)).collect(),
            pending: s.pending.into_iter().map(|p| (p.id, p)).collect(),
            next_pending_id,
        }
    }
}

/// An in-memory store with clone-and-swap transactions.
///
/// Transactions hold the write lock for their whole duration, so they are
/// fully serialized.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes the whole store to JSON.
    pub fn to_json(&self) -> SyncResult<String> {
        let snapshot = Snapshot::from(&*self.tables.read());
        serde_json::to_string_pretty(&snapshot).map_err(|e| SyncError::store(e.to_string()))
    }

    /// Restores a store from JSON.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        let snapshot: Snapshot =
            serde_json::from_str(json).map_err(|e| SyncError::store(e.to_string()))?;
        Ok(Self {
            tables: RwLock::new(snapshot.into()),
        })
    }

    /// Writes a JSON snapshot to `path`.
    pub fn save(&self, path: &Path) -> SyncResult<()> {
        let file = File::create(path).map_err(|e| SyncError::store(format!("{}: {e}", path.display())))?;
        let snapshot = Snapshot::from(&*self.tables.read());
        serde_json::to_writer_pretty(BufWriter::new(file), &snapshot)
            .map_err(|e| SyncError::store(e.to_string()))
    }

    /// Loads a JSON snapshot from `path`.
    pub fn load(path: &Path) -> SyncResult<Self> {
        let file = File::open(path).map_err(|e| SyncError::store(format!("{}: {e}", path.display())))?;
        let snapshot: Snapshot = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| SyncError::store(e.to_string()))?;
        Ok(Self {
            tables: RwLock::new(snapshot.into()),
        })
    }
}

impl ItemStore for MemoryStore {
    fn atomically(&self, body: &mut dyn FnMut(&mut dyn StoreTxn) -> SyncResult<()>) -> SyncResult<()> {
        let mut tables = self.tables.write();
        let mut working = tables.clone();
        body(&mut working)?;
        *tables = working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use groupsync_protocol::{EntityClass, Fields, FolderType, PendingKind, SyncCursor};

    fn inbox() -> Folder {
        Folder::new(ItemRef::server("5"), ItemRef::root(), "Inbox", FolderType::INBOX, 1)
    }

    fn delete_op(target: &str) -> PendingOperation {
        PendingOperation::new(
            PendingKind::ItemDelete,
            EntityClass::Email,
            ItemRef::server(target),
            ItemRef::server("5"),
        )
    }

    #[test]
    fn commit_and_rollback() {
        let store = MemoryStore::new();
        store
            .transaction(|txn| {
                txn.put_folder(inbox());
                Ok(())
            })
            .unwrap();

        let err = store.transaction(|txn| {
            txn.remove_folder(&ItemRef::server("5"));
            Err::<(), _>(SyncError::store("boom"))
        });
        assert!(err.is_err());

        let still_there = store.read(|txn| txn.folder(&ItemRef::server("5"))).unwrap();
        assert_eq!(still_there, Some(inbox()));
    }

    #[test]
    fn pending_ids_are_fifo() {
        let store = MemoryStore::new();
        let ids = store
            .transaction(|txn| {
                Ok(vec![
                    txn.enqueue_pending(delete_op("a")),
                    txn.enqueue_pending(delete_op("b")),
                    txn.enqueue_pending(delete_op("c")),
                ])
            })
            .unwrap();
        assert_eq!(ids, vec![1, 2, 3]);

        store
            .transaction(|txn| {
                txn.remove_pending(2);
                Ok(txn.enqueue_pending(delete_op("d")))
            })
            .unwrap();

        let order: Vec<String> = store
            .read(|txn| txn.pending().into_iter().map(|p| p.target.to_string()).collect())
            .unwrap();
        assert_eq!(order, vec!["a", "c", "d"]);
    }

    #[test]
    fn items_by_folder() {
        let store = MemoryStore::new();
        store
            .transaction(|txn| {
                txn.put_item(Item::new(ItemRef::server("m1"), EntityClass::Email, ItemRef::server("5"), Fields::new()));
                txn.put_item(Item::new(ItemRef::server("m2"), EntityClass::Email, ItemRef::server("6"), Fields::new()));
                Ok(())
            })
            .unwrap();
        let in_five = store.read(|txn| txn.items_in_folder(&ItemRef::server("5"))).unwrap();
        assert_eq!(in_five.len(), 1);
        assert_eq!(in_five[0].id, ItemRef::server("m1"));
    }

    #[test]
    fn snapshot_survives_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = MemoryStore::new();
        store
            .transaction(|txn| {
                let mut state = txn.protocol_state();
                state.hierarchy_cursor = SyncCursor::new("3");
                state.begin_full_refresh();
                txn.set_protocol_state(state);
                txn.put_folder(inbox());
                txn.put_folder(Folder::recovery());
                txn.enqueue_pending(delete_op("a"));
                Ok(())
            })
            .unwrap();
        store.save(&path).unwrap();

        let loaded = MemoryStore::load(&path).unwrap();
        let (epoch, folders, pending) = loaded
            .read(|txn| (txn.protocol_state().epoch, txn.folders().len(), txn.pending()))
            .unwrap();
        assert_eq!(epoch, 2);
        assert_eq!(folders, 2);
        assert_eq!(pending.len(), 1);

        let next = loaded
            .transaction(|txn| Ok(txn.enqueue_pending(delete_op("b"))))
            .unwrap();
        assert_eq!(next, 2);
    }

    #[test]
    fn bad_json_is_a_store_error() {
        let err = MemoryStore::from_json("{").unwrap_err();
        assert!(matches!(err, SyncError::Store(_)));
        let roundtrip = MemoryStore::from_json(&MemoryStore::new().to_json().unwrap()).unwrap();
        assert_eq!(roundtrip.read(|txn| txn.protocol_state().epoch).unwrap(), 1);
    }
}

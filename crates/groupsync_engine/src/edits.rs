//! Local edits: optimistic changes plus their pending rows.
//!
//! Each edit changes the local model and queues the matching pending row
//! in one store transaction, then nudges the account control so the row is
//! sent soon. Edits to objects that never reached the server are folded
//! into the queued create instead of growing the backlog.

use crate::control::ControlHandle;
use crate::dispatch::MIME_FIELD;
use crate::error::{SyncError, SyncResult};
use crate::reconcile::subtree;
use crate::store::{ItemStore, ItemStoreExt, StoreTxn};
use groupsync_protocol::{
    EntityClass, Fields, Folder, FolderType, Item, ItemRef, PendingKind, PendingOperation,
};
use std::sync::Arc;
use tracing::debug;

/// Field carrying the read flag.
pub const READ_FIELD: &str = "Read";

fn queued_row(txn: &dyn StoreTxn, target: &ItemRef, kind: PendingKind) -> Option<PendingOperation> {
    txn.pending()
        .into_iter()
        .find(|op| op.kind == kind && &op.target == target && !op.is_dispatched())
}

fn enqueue(txn: &mut dyn StoreTxn, op: PendingOperation) -> PendingOperation {
    let id = txn.enqueue_pending(op.clone());
    PendingOperation { id, ..op }
}

fn item_or_err(txn: &dyn StoreTxn, id: &ItemRef) -> SyncResult<Item> {
    txn.item(id)
        .ok_or_else(|| SyncError::HardFail(format!("no item {id}")))
}

fn folder_or_err(txn: &dyn StoreTxn, id: &ItemRef) -> SyncResult<Folder> {
    txn.folder(id)
        .ok_or_else(|| SyncError::HardFail(format!("no folder {id}")))
}

/// Entry point for user edits on one account.
#[derive(Clone)]
pub struct LocalEdits {
    store: Arc<dyn ItemStore>,
    control: Option<ControlHandle>,
}

impl LocalEdits {
    /// Creates an edit API over `store`.
    pub fn new(store: Arc<dyn ItemStore>) -> Self {
        Self { store, control: None }
    }

    /// Nudges `control` after every edit that queued a row.
    pub fn with_control(mut self, control: ControlHandle) -> Self {
        self.control = Some(control);
        self
    }

    fn edit<T>(&self, body: impl FnOnce(&mut dyn StoreTxn) -> SyncResult<T>) -> SyncResult<T> {
        let out = self.store.transaction(body)?;
        if let Some(control) = &self.control {
            control.pending_queued();
        }
        Ok(out)
    }

    /// Creates an item under a client id.
    pub fn create_item(&self, class: EntityClass, folder: &ItemRef, fields: Fields) -> SyncResult<PendingOperation> {
        self.edit(|txn| {
            folder_or_err(&*txn, folder)?;
            let id = ItemRef::new_client();
            txn.put_item(Item::new(id.clone(), class, folder.clone(), fields.clone()));
            Ok(enqueue(
                txn,
                PendingOperation::new(PendingKind::ItemCreate, class, id, folder.clone()).with_fields(fields),
            ))
        })
    }

    /// Changes fields of an item.
    pub fn change_item(&self, id: &ItemRef, fields: Fields) -> SyncResult<PendingOperation> {
        self.edit(|txn| {
            let mut item = item_or_err(&*txn, id)?;
            item.fields.extend(fields.clone());
            let class = item.class;
            let folder = item.folder.clone();
            txn.put_item(item);

            for kind in [PendingKind::ItemCreate, PendingKind::ItemChange] {
                if let Some(mut op) = queued_row(&*txn, id, kind) {
                    op.fields.extend(fields);
                    txn.put_pending(op.clone());
                    debug!(id = op.id, ?kind, "change folded into queued row");
                    return Ok(op);
                }
            }
            Ok(enqueue(
                txn,
                PendingOperation::new(PendingKind::ItemChange, class, id.clone(), folder).with_fields(fields),
            ))
        })
    }

    /// Sets or clears the read flag of a message.
    pub fn mark_read(&self, id: &ItemRef, read: bool) -> SyncResult<PendingOperation> {
        let value = if read { "1" } else { "0" };
        self.edit(|txn| {
            let mut item = item_or_err(&*txn, id)?;
            item.fields.insert(READ_FIELD.to_string(), value.to_string());
            let (class, folder) = (item.class, item.folder.clone());
            txn.put_item(item);

            let fields: Fields = [(READ_FIELD.to_string(), value.to_string())].into_iter().collect();
            for kind in [PendingKind::ItemCreate, PendingKind::MarkRead] {
                if let Some(mut op) = queued_row(&*txn, id, kind) {
                    op.fields.extend(fields);
                    txn.put_pending(op.clone());
                    return Ok(op);
                }
            }
            Ok(enqueue(
                txn,
                PendingOperation::new(PendingKind::MarkRead, class, id.clone(), folder).with_fields(fields),
            ))
        })
    }

    /// Deletes an item. Returns `None` when the item never reached the
    /// server and nothing has to be sent.
    ///
    /// A delete issued while the item's create is on the wire is queued
    /// under the client id; it becomes dispatchable once the create is
    /// acknowledged and the id is rewritten.
    pub fn delete_item(&self, id: &ItemRef) -> SyncResult<Option<PendingOperation>> {
        self.edit(|txn| {
            let item = txn
                .remove_item(id)
                .ok_or_else(|| SyncError::HardFail(format!("no item {id}")))?;
            let mut never_sent = false;
            let mut create_in_flight = false;
            // Folder the server still holds the item in.
            let mut server_folder = None;
            for op in txn.pending() {
                if &op.target != id {
                    continue;
                }
                if op.is_dispatched() {
                    create_in_flight |= op.kind == PendingKind::ItemCreate;
                    continue;
                }
                match op.kind {
                    PendingKind::ItemCreate => {
                        never_sent = true;
                        txn.remove_pending(op.id);
                    }
                    PendingKind::ItemMove => {
                        server_folder.get_or_insert(op.folder.clone());
                        txn.remove_pending(op.id);
                    }
                    PendingKind::ItemChange | PendingKind::MarkRead => {
                        txn.remove_pending(op.id);
                    }
                    _ => {}
                }
            }
            if never_sent || (id.is_client() && !create_in_flight) {
                return Ok(None);
            }
            let folder = server_folder.unwrap_or(item.folder);
            debug!(%id, %folder, create_in_flight, "item delete queued");
            Ok(Some(enqueue(
                txn,
                PendingOperation::new(PendingKind::ItemDelete, item.class, id.clone(), folder),
            )))
        })
    }

    /// Moves an item to another folder.
    pub fn move_item(&self, id: &ItemRef, dest: &ItemRef) -> SyncResult<PendingOperation> {
        self.edit(|txn| {
            folder_or_err(&*txn, dest)?;
            let mut item = item_or_err(&*txn, id)?;
            let from = std::mem::replace(&mut item.folder, dest.clone());
            let class = item.class;
            txn.put_item(item);

            if let Some(mut create) = queued_row(&*txn, id, PendingKind::ItemCreate) {
                create.folder = dest.clone();
                txn.put_pending(create.clone());
                return Ok(create);
            }
            Ok(enqueue(
                txn,
                PendingOperation::new(PendingKind::ItemMove, class, id.clone(), from).with_dest_folder(dest.clone()),
            ))
        })
    }

    /// Queues a new outgoing message.
    pub fn send(&self, mime: impl Into<String>) -> SyncResult<PendingOperation> {
        let fields: Fields = [(MIME_FIELD.to_string(), mime.into())].into_iter().collect();
        self.edit(|txn| {
            Ok(enqueue(
                txn,
                PendingOperation::new(PendingKind::Send, EntityClass::Email, ItemRef::new_client(), ItemRef::root())
                    .with_fields(fields),
            ))
        })
    }

    /// Queues a reply quoting `source`.
    pub fn reply(&self, source: &ItemRef, mime: impl Into<String>) -> SyncResult<PendingOperation> {
        self.outgoing(PendingKind::Reply, source, mime.into())
    }

    /// Queues a forward of `source`.
    pub fn forward(&self, source: &ItemRef, mime: impl Into<String>) -> SyncResult<PendingOperation> {
        self.outgoing(PendingKind::Forward, source, mime.into())
    }

    fn outgoing(&self, kind: PendingKind, source: &ItemRef, mime: String) -> SyncResult<PendingOperation> {
        let fields: Fields = [(MIME_FIELD.to_string(), mime)].into_iter().collect();
        self.edit(|txn| {
            let item = item_or_err(&*txn, source)?;
            Ok(enqueue(
                txn,
                PendingOperation::new(kind, EntityClass::Email, ItemRef::new_client(), item.folder.clone())
                    .with_source(source.clone(), item.folder)
                    .with_fields(fields),
            ))
        })
    }

    /// Creates a folder under a client id.
    pub fn create_folder(
        &self,
        parent: &ItemRef,
        name: impl Into<String>,
        folder_type: FolderType,
    ) -> SyncResult<PendingOperation> {
        let name = name.into();
        self.edit(|txn| {
            if !parent.is_root() {
                folder_or_err(&*txn, parent)?;
            }
            let id = ItemRef::new_client();
            let epoch = txn.protocol_state().epoch;
            txn.put_folder(Folder::new(id.clone(), parent.clone(), name.clone(), folder_type, epoch));
            Ok(enqueue(
                txn,
                PendingOperation::new(PendingKind::FolderCreate, EntityClass::Folder, id, parent.clone())
                    .with_display_name(name)
                    .with_folder_type(folder_type),
            ))
        })
    }

    /// Renames a folder.
    pub fn rename_folder(&self, id: &ItemRef, name: impl Into<String>) -> SyncResult<PendingOperation> {
        let name = name.into();
        self.update_folder(id, |folder| folder.display_name = name.clone(), None)
    }

    /// Moves a folder under `new_parent`.
    pub fn move_folder(&self, id: &ItemRef, new_parent: &ItemRef) -> SyncResult<PendingOperation> {
        self.update_folder(id, |folder| folder.parent = new_parent.clone(), Some(new_parent))
    }

    fn update_folder(
        &self,
        id: &ItemRef,
        change: impl FnOnce(&mut Folder),
        dest: Option<&ItemRef>,
    ) -> SyncResult<PendingOperation> {
        self.edit(|txn| {
            let mut folder = folder_or_err(&*txn, id)?;
            let old_parent = folder.parent.clone();
            change(&mut folder);
            let (name, parent) = (folder.display_name.clone(), folder.parent.clone());
            txn.put_folder(folder);

            if let Some(mut create) = queued_row(&*txn, id, PendingKind::FolderCreate) {
                create.display_name = Some(name);
                create.folder = parent;
                txn.put_pending(create.clone());
                return Ok(create);
            }
            if let Some(mut update) = queued_row(&*txn, id, PendingKind::FolderUpdate) {
                update.display_name = Some(name);
                if let Some(dest) = dest {
                    update.dest_folder = Some(dest.clone());
                }
                txn.put_pending(update.clone());
                return Ok(update);
            }
            let mut op = PendingOperation::new(PendingKind::FolderUpdate, EntityClass::Folder, id.clone(), old_parent)
                .with_display_name(name);
            if let Some(dest) = dest {
                op = op.with_dest_folder(dest.clone());
            }
            Ok(enqueue(txn, op))
        })
    }

    /// Deletes a folder and, locally and at once, everything beneath it.
    /// Returns `None` when the folder never reached the server.
    pub fn delete_folder(&self, id: &ItemRef) -> SyncResult<Option<PendingOperation>> {
        self.edit(|txn| {
            let folder = folder_or_err(&*txn, id)?;
            if folder.client_owned && !id.is_client() {
                return Err(SyncError::HardFail(format!("folder {id} is local only")));
            }
            let doomed = subtree(&*txn, id);

            for op in txn.pending() {
                let inside = std::iter::once(&op.target)
                    .chain(std::iter::once(&op.folder))
                    .chain(op.dest_folder.iter())
                    .any(|r| doomed.contains(r) || txn.item(r).is_some_and(|i| doomed.contains(&i.folder)));
                if inside && !op.is_dispatched() {
                    txn.remove_pending(op.id);
                }
            }
            for f in &doomed {
                for item in txn.items_in_folder(f) {
                    txn.remove_item(&item.id);
                }
                txn.remove_folder(f);
            }

            if id.is_client() {
                return Ok(None);
            }
            Ok(Some(enqueue(
                txn,
                PendingOperation::new(PendingKind::FolderDelete, EntityClass::Folder, id.clone(), folder.parent),
            )))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn setup() -> (Arc<MemoryStore>, LocalEdits) {
        let store = Arc::new(MemoryStore::new());
        store
            .transaction(|txn| {
                txn.put_folder(Folder::new(ItemRef::server("5"), ItemRef::root(), "Inbox", FolderType::INBOX, 1));
                txn.put_folder(Folder::new(ItemRef::server("9"), ItemRef::server("5"), "Old", FolderType::USER_MAIL, 1));
                txn.put_item(Item::new(ItemRef::server("5:1"), EntityClass::Email, ItemRef::server("5"), Fields::new()));
                txn.put_item(Item::new(ItemRef::server("9:1"), EntityClass::Email, ItemRef::server("9"), Fields::new()));
                Ok(())
            })
            .unwrap();
        let edits = LocalEdits::new(Arc::clone(&store) as Arc<dyn ItemStore>);
        (store, edits)
    }

    fn subject(s: &str) -> Fields {
        [("Subject".to_string(), s.to_string())].into_iter().collect()
    }

    #[test]
    fn create_then_change_folds_into_create() {
        let (store, edits) = setup();
        let create = edits.create_item(EntityClass::Email, &ItemRef::server("5"), subject("a")).unwrap();
        assert!(create.target.is_client());
        let folded = edits.change_item(&create.target, subject("b")).unwrap();
        assert_eq!(folded.id, create.id);

        let pending = store.read(|txn| txn.pending()).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].fields.get("Subject").map(String::as_str), Some("b"));

        assert_eq!(edits.delete_item(&create.target).unwrap(), None);
        assert!(store.read(|txn| txn.pending()).unwrap().is_empty());
    }

    #[test]
    fn delete_supersedes_queued_edits() {
        let (store, edits) = setup();
        let target = ItemRef::server("5:1");
        edits.mark_read(&target, true).unwrap();
        edits.mark_read(&target, false).unwrap();
        assert_eq!(store.read(|txn| txn.pending().len()).unwrap(), 1);

        let delete = edits.delete_item(&target).unwrap().unwrap();
        let pending = store.read(|txn| txn.pending()).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, delete.id);
        assert_eq!(pending[0].kind, PendingKind::ItemDelete);
    }

    #[test]
    fn delete_during_create_round_trip_survives_acknowledgement() {
        let (store, edits) = setup();
        let create = edits.create_item(EntityClass::Email, &ItemRef::server("5"), subject("a")).unwrap();
        store
            .transaction(|txn| {
                let mut op = txn.pending_op(create.id).unwrap();
                op.mark_dispatched();
                txn.put_pending(op);
                Ok(())
            })
            .unwrap();

        let delete = edits.delete_item(&create.target).unwrap().unwrap();
        assert_eq!(delete.kind, PendingKind::ItemDelete);
        assert_eq!(delete.target, create.target);
        assert!(!delete.is_dispatchable());

        store
            .transaction(|txn| {
                let mut report = crate::reconcile::ReconcileReport::default();
                crate::reconcile::resolve_created(txn, &create.target, "5:77", &mut report);
                Ok(())
            })
            .unwrap();
        let pending = store.read(|txn| txn.pending()).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, PendingKind::ItemDelete);
        assert_eq!(pending[0].target, ItemRef::server("5:77"));
        assert!(pending[0].is_dispatchable());
    }

    #[test]
    fn delete_after_unsent_move_targets_source_folder() {
        let (store, edits) = setup();
        let target = ItemRef::server("5:1");
        edits.move_item(&target, &ItemRef::server("9")).unwrap();

        let delete = edits.delete_item(&target).unwrap().unwrap();
        assert_eq!(delete.folder, ItemRef::server("5"));
        let pending = store.read(|txn| txn.pending()).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, PendingKind::ItemDelete);
        assert_eq!(pending[0].folder, ItemRef::server("5"));
    }

    #[test]
    fn delete_after_sent_move_targets_destination() {
        let (store, edits) = setup();
        let target = ItemRef::server("5:1");
        let moved = edits.move_item(&target, &ItemRef::server("9")).unwrap();
        store
            .transaction(|txn| {
                let mut op = txn.pending_op(moved.id).unwrap();
                op.mark_dispatched();
                txn.put_pending(op);
                Ok(())
            })
            .unwrap();

        let delete = edits.delete_item(&target).unwrap().unwrap();
        assert_eq!(delete.folder, ItemRef::server("9"));
        assert_eq!(store.read(|txn| txn.pending().len()).unwrap(), 2);
    }

    #[test]
    fn move_and_reply() {
        let (store, edits) = setup();
        let moved = edits.move_item(&ItemRef::server("5:1"), &ItemRef::server("9")).unwrap();
        assert_eq!(moved.folder, ItemRef::server("5"));
        assert_eq!(moved.dest_folder, Some(ItemRef::server("9")));

        let reply = edits.reply(&ItemRef::server("5:1"), "Subject: re").unwrap();
        assert_eq!(reply.source_folder, Some(ItemRef::server("9")));
        assert!(reply.is_dispatchable());
        assert!(edits.forward(&ItemRef::server("nope"), "x").is_err());
        assert_eq!(store.read(|txn| txn.pending().len()).unwrap(), 2);
    }

    #[test]
    fn folder_edits() {
        let (store, edits) = setup();
        let created = edits.create_folder(&ItemRef::root(), "New", FolderType::USER_MAIL).unwrap();
        let renamed = edits.rename_folder(&created.target, "Newer").unwrap();
        assert_eq!(renamed.id, created.id);
        assert_eq!(renamed.display_name.as_deref(), Some("Newer"));

        let moved = edits.move_folder(&ItemRef::server("9"), &ItemRef::root()).unwrap();
        assert_eq!(moved.kind, PendingKind::FolderUpdate);
        assert_eq!(moved.dest_folder, Some(ItemRef::root()));
        assert_eq!(moved.display_name.as_deref(), Some("Old"));

        assert_eq!(edits.delete_folder(&created.target).unwrap(), None);
        assert_eq!(store.read(|txn| txn.pending().len()).unwrap(), 1);
    }

    #[test]
    fn folder_delete_removes_subtree_at_once() {
        let (store, edits) = setup();
        edits.mark_read(&ItemRef::server("9:1"), true).unwrap();
        let delete = edits.delete_folder(&ItemRef::server("5")).unwrap().unwrap();
        assert_eq!(delete.kind, PendingKind::FolderDelete);

        let (folders, items, pending) = store
            .read(|txn| (txn.folders(), txn.item(&ItemRef::server("9:1")), txn.pending()))
            .unwrap();
        assert!(folders.is_empty());
        assert!(items.is_none());
        assert_eq!(pending.len(), 1);
    }
}

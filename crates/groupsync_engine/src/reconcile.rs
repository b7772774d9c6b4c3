//! Conflict reconciliation.
//!
//! Merges server deltas into the item store and the pending backlog. The
//! server is authoritative: a delta that dominates a pending row rewrites
//! or cancels it, and the two are never applied independently.
//!
//! Everything here runs inside the caller's store transaction and is
//! idempotent: applying the same delta twice leaves the store as the first
//! application left it.

use crate::error::SyncResult;
use crate::store::StoreTxn;
use groupsync_protocol::{
    DeltaKind, EntityClass, Fields, Folder, FolderType, Item, ItemRef, PendingKind,
    PendingOperation, ServerDelta,
};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Suffix given to a pending folder create that collides with a server
/// folder of another type.
pub const CLIENT_CREATED_SUFFIX: &str = " Client-Created";
/// Suffix given to a pending folder move that collides with a server folder.
pub const CLIENT_MOVED_SUFFIX: &str = " Client-Moved";

// Folder trees deeper than this are treated as cyclic.
const MAX_DEPTH: usize = 64;

/// How a pending row relates to the target of a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// The row acts on the delta's target.
    SameTarget,
    /// The row quotes the delta's target (reply/forward source).
    Source,
    /// The row acts on something beneath the delta's target folder.
    Descendant,
    /// No relationship.
    Unrelated,
}

/// Tally of what one or more reconciliations did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Deltas that changed the store.
    pub applied: usize,
    /// Deltas that were already reflected or were superseded locally.
    pub skipped: usize,
    /// Pending rows cancelled.
    pub pending_removed: usize,
    /// Pending rows whose references were rewritten.
    pub pending_rewritten: usize,
    /// Replies and forwards converted to plain sends.
    pub converted: usize,
    /// Items moved to the recovery folder.
    pub rescued: usize,
}

impl ReconcileReport {
    /// Adds another report into this one.
    pub fn merge(&mut self, other: &ReconcileReport) {
        self.applied += other.applied;
        self.skipped += other.skipped;
        self.pending_removed += other.pending_removed;
        self.pending_rewritten += other.pending_rewritten;
        self.converted += other.converted;
        self.rescued += other.rescued;
    }
}

/// Per-class rules. One implementation per entity class, selected by the
/// class tag with [`handler_for`].
pub trait ClassHandler: Send + Sync {
    /// Class handled.
    fn class(&self) -> EntityClass;

    /// Returns true if a server-added object is the echo of this pending
    /// create.
    fn matches_create(&self, op: &PendingOperation, delta: &ServerDelta) -> bool;
}

fn same_fields(a: &Fields, b: &Fields, keys: &[&str]) -> bool {
    keys.iter().all(|k| a.get(*k) == b.get(*k)) && keys.iter().any(|k| a.contains_key(*k))
}

struct EmailHandler;
struct ContactHandler;
struct CalendarHandler;
struct TaskHandler;
struct FolderHandler;

impl ClassHandler for EmailHandler {
    fn class(&self) -> EntityClass {
        EntityClass::Email
    }

    fn matches_create(&self, op: &PendingOperation, delta: &ServerDelta) -> bool {
        same_fields(&op.fields, &delta.fields, &["Subject"])
    }
}

impl ClassHandler for ContactHandler {
    fn class(&self) -> EntityClass {
        EntityClass::Contact
    }

    fn matches_create(&self, op: &PendingOperation, delta: &ServerDelta) -> bool {
        same_fields(&op.fields, &delta.fields, &["FileAs"])
    }
}

impl ClassHandler for CalendarHandler {
    fn class(&self) -> EntityClass {
        EntityClass::Calendar
    }

    fn matches_create(&self, op: &PendingOperation, delta: &ServerDelta) -> bool {
        same_fields(&op.fields, &delta.fields, &["Subject", "StartTime"])
    }
}

impl ClassHandler for TaskHandler {
    fn class(&self) -> EntityClass {
        EntityClass::Task
    }

    fn matches_create(&self, op: &PendingOperation, delta: &ServerDelta) -> bool {
        same_fields(&op.fields, &delta.fields, &["Subject"])
    }
}

impl ClassHandler for FolderHandler {
    fn class(&self) -> EntityClass {
        EntityClass::Folder
    }

    fn matches_create(&self, op: &PendingOperation, delta: &ServerDelta) -> bool {
        op.display_name.as_deref() == delta.display_name.as_deref()
            && op.folder == delta.parent()
            && op.folder_type == delta.folder_type
    }
}

/// Returns the handler for `class`.
pub fn handler_for(class: EntityClass) -> &'static dyn ClassHandler {
    match class {
        EntityClass::Email => &EmailHandler,
        EntityClass::Contact => &ContactHandler,
        EntityClass::Calendar => &CalendarHandler,
        EntityClass::Task => &TaskHandler,
        EntityClass::Folder => &FolderHandler,
    }
}

/// Returns true if `folder` is `ancestor` or lies beneath it.
pub fn folder_within(txn: &dyn StoreTxn, folder: &ItemRef, ancestor: &ItemRef) -> bool {
    let mut current = folder.clone();
    for _ in 0..MAX_DEPTH {
        if &current == ancestor {
            return true;
        }
        match txn.folder(&current) {
            Some(f) if !current.is_root() => current = f.parent,
            _ => return false,
        }
    }
    warn!(%folder, "folder tree too deep or cyclic");
    false
}

fn ref_within(txn: &dyn StoreTxn, r: &ItemRef, ancestor: &ItemRef) -> bool {
    if let Some(item) = txn.item(r) {
        return folder_within(txn, &item.folder, ancestor);
    }
    folder_within(txn, r, ancestor)
}

/// Classifies `op` against the target of a delta. `container` is true
/// when the target is a folder, so rows beneath it are descendants.
pub fn relation(txn: &dyn StoreTxn, op: &PendingOperation, target: &ItemRef, container: bool) -> Relation {
    if &op.target == target {
        return Relation::SameTarget;
    }
    if op.source.as_ref() == Some(target) {
        return Relation::Source;
    }
    if container {
        let beneath = std::iter::once(&op.target)
            .chain(std::iter::once(&op.folder))
            .chain(op.dest_folder.iter())
            .any(|r| ref_within(txn, r, target));
        if beneath {
            return Relation::Descendant;
        }
    }
    Relation::Unrelated
}

/// Replaces every reference to `from` with `to`: pending rows, the item or
/// folder carrying the id, and everything filed under it.
///
/// Returns the number of pending rows rewritten.
pub fn rewrite_ref(txn: &mut dyn StoreTxn, from: &ItemRef, to: &ItemRef) -> usize {
    if from == to {
        return 0;
    }
    let mut rewritten = 0;
    for mut op in txn.pending() {
        if op.rewrite_ref(from, to) {
            txn.put_pending(op);
            rewritten += 1;
        }
    }

    if let Some(mut item) = txn.remove_item(from) {
        item.id = to.clone();
        txn.put_item(item);
    }

    if let Some(mut folder) = txn.remove_folder(from) {
        folder.id = to.clone();
        if !folder.client_owned {
            folder.reset_cursor();
        }
        txn.put_folder(folder);
        for mut item in txn.items_in_folder(from) {
            item.folder = to.clone();
            txn.put_item(item);
        }
        for mut child in txn.folders().into_iter().filter(|f| &f.parent == from) {
            child.parent = to.clone();
            txn.put_folder(child);
        }
    }

    debug!(%from, %to, rewritten, "rewrote temporary id");
    rewritten
}

/// Resolves a pending create that the server acknowledged with a real id.
pub fn resolve_created(
    txn: &mut dyn StoreTxn,
    client: &ItemRef,
    server_id: &str,
    report: &mut ReconcileReport,
) {
    let server = ItemRef::server(server_id);
    for op in txn.pending() {
        if op.target == *client && op.kind.creates_target() {
            txn.remove_pending(op.id);
            report.pending_removed += 1;
        }
    }
    report.pending_rewritten += rewrite_ref(txn, client, &server);
    info!(client = %client, server = server_id, "create acknowledged");
}

/// Ensures the recovery folder exists and returns its id.
pub fn ensure_recovery_folder(txn: &mut dyn StoreTxn) -> ItemRef {
    let id = Folder::recovery_ref();
    if txn.folder(&id).is_none() {
        txn.put_folder(Folder::recovery());
    }
    id
}

/// Applies one server delta. `epoch` stamps folders the delta touches.
pub fn apply_delta(
    txn: &mut dyn StoreTxn,
    delta: &ServerDelta,
    epoch: u64,
    report: &mut ReconcileReport,
) -> SyncResult<()> {
    if delta.is_folder() {
        match delta.kind {
            DeltaKind::Add => folder_add(txn, delta, epoch, report),
            DeltaKind::Change => folder_update(txn, delta, epoch, report),
            DeltaKind::Delete => folder_delete(txn, delta, report),
        }
    } else {
        match delta.kind {
            DeltaKind::Add => item_add(txn, delta, report),
            DeltaKind::Change => item_change(txn, delta, report),
            DeltaKind::Delete => item_delete(txn, delta, report),
        }
    }
    Ok(())
}

fn remove_row(txn: &mut dyn StoreTxn, op: &PendingOperation, why: &str, report: &mut ReconcileReport) {
    if txn.remove_pending(op.id).is_some() {
        debug!(id = op.id, kind = ?op.kind, target = %op.target, why, "pending row cancelled");
        report.pending_removed += 1;
    }
}

fn convert_row(txn: &mut dyn StoreTxn, mut op: PendingOperation, report: &mut ReconcileReport) {
    if op.convert_to_send() {
        info!(id = op.id, "source changed on server, reply/forward becomes a send");
        txn.put_pending(op);
        report.converted += 1;
    }
}

fn item_add(txn: &mut dyn StoreTxn, delta: &ServerDelta, report: &mut ReconcileReport) {
    let target = delta.target();
    let folder = delta.parent();

    if let Some(client_id) = &delta.client_id {
        resolve_created(txn, &ItemRef::Client(client_id.clone()), &delta.server_id, report);
    }

    if let Some(existing) = txn.item(&target) {
        if existing.fields == delta.fields && existing.folder == folder {
            report.skipped += 1;
            return;
        }
    } else {
        let handler = handler_for(delta.class);
        let echo = txn.pending().into_iter().find(|op| {
            op.kind == PendingKind::ItemCreate
                && op.class == delta.class
                && op.folder == folder
                && op.target.is_client()
                && handler.matches_create(op, delta)
        });
        if let Some(op) = echo {
            let client = op.target.clone();
            resolve_created(txn, &client, &delta.server_id, report);
        }
    }

    txn.put_item(Item::new(target, delta.class, folder, delta.fields.clone()));
    report.applied += 1;
}

fn item_change(txn: &mut dyn StoreTxn, delta: &ServerDelta, report: &mut ReconcileReport) {
    let target = delta.target();
    for op in txn.pending() {
        match (relation(&*txn, &op, &target, false), op.kind) {
            (Relation::Source, PendingKind::Reply | PendingKind::Forward) => convert_row(txn, op, report),
            (Relation::SameTarget, PendingKind::ItemChange) => remove_row(txn, &op, "server wins", report),
            _ => {}
        }
    }

    let item = match txn.item(&target) {
        Some(mut existing) => {
            let mut fields = existing.fields.clone();
            fields.extend(delta.fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            if fields == existing.fields {
                report.skipped += 1;
                return;
            }
            existing.fields = fields;
            existing
        }
        None => Item::new(target, delta.class, delta.parent(), delta.fields.clone()),
    };
    txn.put_item(item);
    report.applied += 1;
}

fn item_delete(txn: &mut dyn StoreTxn, delta: &ServerDelta, report: &mut ReconcileReport) {
    let target = delta.target();
    for op in txn.pending() {
        match (relation(&*txn, &op, &target, false), op.kind) {
            (Relation::Source, PendingKind::Reply | PendingKind::Forward) => convert_row(txn, op, report),
            (
                Relation::SameTarget,
                PendingKind::ItemChange | PendingKind::ItemMove | PendingKind::MarkRead | PendingKind::ItemDelete,
            ) => remove_row(txn, &op, "item deleted on server", report),
            _ => {}
        }
    }

    if txn.remove_item(&target).is_some() {
        report.applied += 1;
    } else {
        report.skipped += 1;
    }
}

fn folder_add(txn: &mut dyn StoreTxn, delta: &ServerDelta, epoch: u64, report: &mut ReconcileReport) {
    let target = delta.target();
    let parent = delta.parent();
    let name = delta.display_name.clone().unwrap_or_default();
    let folder_type = delta.folder_type.unwrap_or(FolderType::USER_GENERIC);

    if let Some(client_id) = &delta.client_id {
        resolve_created(txn, &ItemRef::Client(client_id.clone()), &delta.server_id, report);
    }

    if let Some(mut existing) = txn.folder(&target) {
        let unchanged = existing.parent == parent
            && existing.display_name == name
            && existing.folder_type == folder_type
            && existing.epoch == epoch
            && !existing.client_owned;
        if unchanged {
            report.skipped += 1;
            return;
        }
        let refreshed = existing.epoch < epoch;
        existing.parent = parent;
        existing.display_name = name;
        existing.folder_type = folder_type;
        existing.epoch = epoch;
        existing.client_owned = false;
        if refreshed {
            existing.reset_cursor();
        }
        txn.put_folder(existing);
        report.applied += 1;
        return;
    }

    // Rows are re-read one by one: resolving a create rewrites later rows.
    let ids: Vec<u64> = txn.pending().iter().map(|op| op.id).collect();
    for id in ids {
        let Some(mut op) = txn.pending_op(id) else {
            continue;
        };
        let same_place = op.display_name.as_deref() == Some(name.as_str());
        match op.kind {
            PendingKind::FolderCreate if same_place && op.folder == parent && op.target.is_client() => {
                if handler_for(EntityClass::Folder).matches_create(&op, delta) {
                    let client = op.target.clone();
                    resolve_created(txn, &client, &delta.server_id, report);
                } else {
                    let renamed = format!("{name}{CLIENT_CREATED_SUFFIX}");
                    info!(id = op.id, %renamed, "pending folder create collides with server folder of another type");
                    if let Some(mut local) = txn.folder(&op.target) {
                        local.display_name = renamed.clone();
                        txn.put_folder(local);
                    }
                    op.display_name = Some(renamed);
                    txn.put_pending(op);
                    report.pending_rewritten += 1;
                }
            }
            PendingKind::FolderUpdate
                if same_place && op.target != target && op.dest_folder.as_ref().unwrap_or(&op.folder) == &parent =>
            {
                let renamed = format!("{name}{CLIENT_MOVED_SUFFIX}");
                info!(id = op.id, %renamed, "pending folder move collides with server folder");
                if let Some(mut local) = txn.folder(&op.target) {
                    local.display_name = renamed.clone();
                    txn.put_folder(local);
                }
                op.display_name = Some(renamed);
                txn.put_pending(op);
                report.pending_rewritten += 1;
            }
            _ => {}
        }
    }

    txn.put_folder(Folder::new(target, parent, name, folder_type, epoch));
    report.applied += 1;
}

fn folder_update(txn: &mut dyn StoreTxn, delta: &ServerDelta, epoch: u64, report: &mut ReconcileReport) {
    let target = delta.target();
    for op in txn.pending() {
        if op.kind == PendingKind::FolderUpdate && op.target == target {
            remove_row(txn, &op, "server renamed or moved the folder", report);
        }
    }

    let existing = txn.folder(&target);
    let mut folder = existing.clone().unwrap_or_else(|| {
        Folder::new(
            target,
            delta.parent(),
            delta.display_name.clone().unwrap_or_default(),
            delta.folder_type.unwrap_or(FolderType::USER_GENERIC),
            epoch,
        )
    });
    folder.parent = delta.parent();
    if let Some(name) = &delta.display_name {
        folder.display_name = name.clone();
    }
    if let Some(folder_type) = delta.folder_type {
        folder.folder_type = folder_type;
    }
    folder.epoch = folder.epoch.max(epoch);
    if existing.as_ref() == Some(&folder) {
        report.skipped += 1;
        return;
    }
    txn.put_folder(folder);
    report.applied += 1;
}

/// Collects `root` and every folder beneath it.
pub fn subtree(txn: &dyn StoreTxn, root: &ItemRef) -> BTreeSet<ItemRef> {
    let mut out = BTreeSet::new();
    if txn.folder(root).is_none() {
        return out;
    }
    out.insert(root.clone());
    let folders = txn.folders();
    loop {
        let before = out.len();
        for f in &folders {
            if out.contains(&f.parent) && !out.contains(&f.id) {
                out.insert(f.id.clone());
            }
        }
        if out.len() == before {
            return out;
        }
    }
}

fn folder_delete(txn: &mut dyn StoreTxn, delta: &ServerDelta, report: &mut ReconcileReport) {
    let target = delta.target();

    let dominated_locally = txn.pending().iter().any(|op| {
        op.kind == PendingKind::FolderDelete && folder_within(&*txn, &target, &op.target)
    });
    if dominated_locally {
        debug!(folder = %target, "server delete already covered by a pending folder delete");
        report.skipped += 1;
        return;
    }

    let doomed = subtree(&*txn, &target);
    if doomed.is_empty() {
        report.skipped += 1;
        return;
    }

    let pending = txn.pending();
    let mut rescue = BTreeSet::new();
    for op in &pending {
        let inside = matches!(relation(&*txn, op, &target, true), Relation::SameTarget | Relation::Descendant);
        if !inside {
            continue;
        }
        if matches!(op.kind, PendingKind::ItemCreate | PendingKind::ItemChange) && txn.item(&op.target).is_some() {
            rescue.insert(op.target.clone());
        }
    }

    if !rescue.is_empty() {
        let recovery = ensure_recovery_folder(txn);
        for id in &rescue {
            if let Some(mut item) = txn.item(id) {
                warn!(item = %id, "rescuing locally edited item from deleted folder");
                item.folder = recovery.clone();
                txn.put_item(item);
                report.rescued += 1;
            }
        }
    }

    for op in &pending {
        let hit = rescue.contains(&op.target)
            || std::iter::once(&op.target)
                .chain(std::iter::once(&op.folder))
                .chain(op.dest_folder.iter())
                .any(|r| doomed.contains(r) || txn.item(r).map(|i| doomed.contains(&i.folder)).unwrap_or(false));
        if hit {
            remove_row(txn, op, "folder deleted on server", report);
        }
    }

    for folder in &doomed {
        for item in txn.items_in_folder(folder) {
            txn.remove_item(&item.id);
        }
        txn.remove_folder(folder);
    }
    info!(folder = %target, folders = doomed.len(), "folder subtree deleted by server");
    report.applied += 1;
}

/// Moves non-client-owned folders whose epoch is older than `epoch` under
/// the recovery folder. Returns how many were relocated.
pub fn scrub_stale_folders(txn: &mut dyn StoreTxn, epoch: u64) -> usize {
    let stale: Vec<Folder> = txn
        .folders()
        .into_iter()
        .filter(|f| !f.client_owned && !f.id.is_client() && f.epoch < epoch)
        .collect();
    if stale.is_empty() {
        return 0;
    }
    let recovery = ensure_recovery_folder(txn);
    let stale_ids: BTreeSet<ItemRef> = stale.iter().map(|f| f.id.clone()).collect();
    for mut folder in stale {
        // Nested stale folders keep their parent so the subtree moves whole.
        if !stale_ids.contains(&folder.parent) {
            folder.parent = recovery.clone();
        }
        warn!(folder = %folder.id, name = %folder.display_name, "folder missing from refreshed hierarchy, moved to recovery");
        folder.client_owned = true;
        folder.sync_required = false;
        txn.put_folder(folder);
    }
    stale_ids.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ItemStoreExt, MemoryStore};
    use groupsync_protocol::FolderType;

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .transaction(|txn| {
                txn.put_folder(Folder::new(ItemRef::server("5"), ItemRef::root(), "Inbox", FolderType::INBOX, 1));
                txn.put_folder(Folder::new(ItemRef::server("7"), ItemRef::server("5"), "Work", FolderType::USER_MAIL, 1));
                txn.put_item(Item::new(
                    ItemRef::server("7:1"),
                    EntityClass::Email,
                    ItemRef::server("7"),
                    fields(&[("Subject", "hello")]),
                ));
                Ok(())
            })
            .unwrap();
        store
    }

    fn apply(store: &MemoryStore, delta: &ServerDelta) -> ReconcileReport {
        store
            .transaction(|txn| {
                let mut report = ReconcileReport::default();
                apply_delta(txn, delta, 1, &mut report)?;
                Ok(report)
            })
            .unwrap()
    }

    fn enqueue(store: &MemoryStore, op: PendingOperation) -> u64 {
        store.transaction(|txn| Ok(txn.enqueue_pending(op))).unwrap()
    }

    #[test]
    fn handlers_dispatch_by_class() {
        for class in EntityClass::ITEMS {
            assert_eq!(handler_for(class).class(), class);
        }
        assert_eq!(handler_for(EntityClass::Folder).class(), EntityClass::Folder);
    }

    #[test]
    fn calendar_match_needs_subject_and_start() {
        let op = PendingOperation::new(
            PendingKind::ItemCreate,
            EntityClass::Calendar,
            ItemRef::new_client(),
            ItemRef::server("c"),
        )
        .with_fields(fields(&[("Subject", "standup"), ("StartTime", "0900")]));
        let same = ServerDelta::item(DeltaKind::Add, EntityClass::Calendar, "c:1", "c", fields(&[("Subject", "standup"), ("StartTime", "0900")]));
        let moved = ServerDelta::item(DeltaKind::Add, EntityClass::Calendar, "c:1", "c", fields(&[("Subject", "standup"), ("StartTime", "1000")]));
        let handler = handler_for(EntityClass::Calendar);
        assert!(handler.matches_create(&op, &same));
        assert!(!handler.matches_create(&op, &moved));
    }

    #[test]
    fn add_is_idempotent() {
        let store = seeded();
        let delta = ServerDelta::item(DeltaKind::Add, EntityClass::Email, "5:9", "5", fields(&[("Subject", "new")]));
        let first = apply(&store, &delta);
        assert_eq!(first.applied, 1);
        let snapshot = store.to_json().unwrap();

        let second = apply(&store, &delta);
        assert_eq!(second.applied, 0);
        assert_eq!(second.skipped, 1);
        assert_eq!(store.to_json().unwrap(), snapshot);
    }

    #[test]
    fn echoed_create_rewrites_backlog() {
        let store = seeded();
        let temp = ItemRef::new_client();
        store
            .transaction(|txn| {
                txn.put_item(Item::new(temp.clone(), EntityClass::Email, ItemRef::server("5"), fields(&[("Subject", "draft")])));
                Ok(())
            })
            .unwrap();
        enqueue(
            &store,
            PendingOperation::new(PendingKind::ItemCreate, EntityClass::Email, temp.clone(), ItemRef::server("5"))
                .with_fields(fields(&[("Subject", "draft")])),
        );
        let move_id = enqueue(
            &store,
            PendingOperation::new(PendingKind::ItemMove, EntityClass::Email, temp.clone(), ItemRef::server("5"))
                .with_dest_folder(ItemRef::server("7")),
        );

        let delta = ServerDelta::item(DeltaKind::Add, EntityClass::Email, "5:20", "5", fields(&[("Subject", "draft")]));
        let report = apply(&store, &delta);
        assert_eq!(report.pending_removed, 1);
        assert_eq!(report.pending_rewritten, 1);

        let (pending, temp_item, real_item) = store
            .read(|txn| (txn.pending(), txn.item(&temp), txn.item(&ItemRef::server("5:20"))))
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, move_id);
        assert_eq!(pending[0].target, ItemRef::server("5:20"));
        assert!(pending[0].is_dispatchable());
        assert!(temp_item.is_none());
        assert!(real_item.is_some());
    }

    #[test]
    fn delete_cancels_edits_and_converts_replies() {
        let store = seeded();
        let target = ItemRef::server("7:1");
        enqueue(&store, PendingOperation::new(PendingKind::MarkRead, EntityClass::Email, target.clone(), ItemRef::server("7")));
        let reply = enqueue(
            &store,
            PendingOperation::new(PendingKind::Reply, EntityClass::Email, ItemRef::new_client(), ItemRef::server("5"))
                .with_source(target.clone(), ItemRef::server("7")),
        );

        let report = apply(&store, &ServerDelta::item(DeltaKind::Delete, EntityClass::Email, "7:1", "7", Fields::new()));
        assert_eq!(report.pending_removed, 1);
        assert_eq!(report.converted, 1);

        let pending = store.read(|txn| txn.pending()).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, reply);
        assert_eq!(pending[0].kind, PendingKind::Send);
        let from = pending[0].converted_from.as_ref().unwrap();
        assert_eq!(from.kind, PendingKind::Reply);
        assert_eq!(from.source, target);

        let again = apply(&store, &ServerDelta::item(DeltaKind::Delete, EntityClass::Email, "7:1", "7", Fields::new()));
        assert_eq!(again.skipped, 1);
        assert_eq!(again.converted, 0);
    }

    #[test]
    fn change_merges_and_server_wins() {
        let store = seeded();
        enqueue(
            &store,
            PendingOperation::new(PendingKind::ItemChange, EntityClass::Email, ItemRef::server("7:1"), ItemRef::server("7"))
                .with_fields(fields(&[("Flag", "1")])),
        );
        let report = apply(&store, &ServerDelta::item(DeltaKind::Change, EntityClass::Email, "7:1", "7", fields(&[("Read", "1")])));
        assert_eq!(report.pending_removed, 1);

        let item = store.read(|txn| txn.item(&ItemRef::server("7:1"))).unwrap().unwrap();
        assert_eq!(item.field("Subject"), Some("hello"));
        assert_eq!(item.field("Read"), Some("1"));
    }

    #[test]
    fn folder_delete_rescues_edited_items() {
        let store = seeded();
        enqueue(
            &store,
            PendingOperation::new(PendingKind::ItemChange, EntityClass::Email, ItemRef::server("7:1"), ItemRef::server("7")),
        );
        enqueue(
            &store,
            PendingOperation::new(PendingKind::ItemDelete, EntityClass::Email, ItemRef::server("5:3"), ItemRef::server("5")),
        );

        let report = apply(&store, &ServerDelta::folder(DeltaKind::Delete, "5", "0", None, None));
        assert_eq!(report.rescued, 1);
        assert_eq!(report.pending_removed, 2);

        let (folders, item, pending) = store
            .read(|txn| (txn.folders(), txn.item(&ItemRef::server("7:1")), txn.pending()))
            .unwrap();
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].id, Folder::recovery_ref());
        assert_eq!(item.unwrap().folder, Folder::recovery_ref());
        assert!(pending.is_empty());
    }

    #[test]
    fn local_folder_delete_dominates_server_delete() {
        let store = seeded();
        enqueue(
            &store,
            PendingOperation::new(PendingKind::FolderDelete, EntityClass::Folder, ItemRef::server("5"), ItemRef::root()),
        );
        let report = apply(&store, &ServerDelta::folder(DeltaKind::Delete, "7", "5", None, None));
        assert_eq!(report.skipped, 1);
        assert!(store.read(|txn| txn.folder(&ItemRef::server("7"))).unwrap().is_some());
    }

    #[test]
    fn folder_create_collision_by_type() {
        let store = seeded();
        let temp = ItemRef::new_client();
        enqueue(
            &store,
            PendingOperation::new(PendingKind::FolderCreate, EntityClass::Folder, temp.clone(), ItemRef::root())
                .with_display_name("Notes")
                .with_folder_type(FolderType::USER_MAIL),
        );
        let delta = ServerDelta::folder(DeltaKind::Add, "30", "0", Some("Notes".into()), Some(FolderType::USER_CONTACTS));
        apply(&store, &delta);

        let pending = store.read(|txn| txn.pending()).unwrap();
        assert_eq!(pending[0].display_name.as_deref(), Some("Notes Client-Created"));
        assert_eq!(pending[0].target, temp);

        let matching = ServerDelta::folder(DeltaKind::Add, "31", "0", Some("Notes Client-Created".into()), Some(FolderType::USER_MAIL));
        apply(&store, &matching);
        let (pending, folder) = store.read(|txn| (txn.pending(), txn.folder(&ItemRef::server("31")))).unwrap();
        assert!(pending.is_empty());
        assert!(folder.is_some());
    }

    #[test]
    fn echoed_folder_create_keeps_rewrite_of_later_rows() {
        let store = seeded();
        let temp = ItemRef::new_client();
        let mut create = PendingOperation::new(PendingKind::FolderCreate, EntityClass::Folder, temp.clone(), ItemRef::root())
            .with_display_name("Notes")
            .with_folder_type(FolderType::USER_MAIL);
        create.mark_dispatched();
        enqueue(&store, create);
        let update = enqueue(
            &store,
            PendingOperation::new(PendingKind::FolderUpdate, EntityClass::Folder, temp.clone(), ItemRef::root())
                .with_display_name("Notes"),
        );

        apply(&store, &ServerDelta::folder(DeltaKind::Add, "31", "0", Some("Notes".into()), Some(FolderType::USER_MAIL)));

        let pending = store.read(|txn| txn.pending()).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, update);
        assert_eq!(pending[0].target, ItemRef::server("31"));
        assert_eq!(pending[0].display_name.as_deref(), Some("Notes"));
        assert!(pending[0].is_dispatchable());
    }

    #[test]
    fn server_rename_beats_pending_rename() {
        let store = seeded();
        enqueue(
            &store,
            PendingOperation::new(PendingKind::FolderUpdate, EntityClass::Folder, ItemRef::server("7"), ItemRef::server("5"))
                .with_display_name("Mine"),
        );
        apply(&store, &ServerDelta::folder(DeltaKind::Change, "7", "5", Some("Theirs".into()), None));
        let (pending, folder) = store.read(|txn| (txn.pending(), txn.folder(&ItemRef::server("7")))).unwrap();
        assert!(pending.is_empty());
        assert_eq!(folder.unwrap().display_name, "Theirs");
    }

    #[test]
    fn scrub_moves_stale_folders() {
        let store = seeded();
        let moved = store
            .transaction(|txn| {
                let mut inbox = txn.folder(&ItemRef::server("5")).unwrap();
                inbox.epoch = 2;
                txn.put_folder(inbox);
                Ok(scrub_stale_folders(txn, 2))
            })
            .unwrap();
        assert_eq!(moved, 1);
        let work = store.read(|txn| txn.folder(&ItemRef::server("7"))).unwrap().unwrap();
        assert_eq!(work.parent, Folder::recovery_ref());
        assert!(work.client_owned);
        assert!(!work.sync_required);
    }

    #[test]
    fn relation_classification() {
        let store = seeded();
        store
            .read(|txn| {
                let same = PendingOperation::new(PendingKind::ItemChange, EntityClass::Email, ItemRef::server("7:1"), ItemRef::server("7"));
                assert_eq!(relation(txn, &same, &ItemRef::server("7:1"), false), Relation::SameTarget);
                assert_eq!(relation(txn, &same, &ItemRef::server("5"), true), Relation::Descendant);
                assert_eq!(relation(txn, &same, &ItemRef::server("9"), true), Relation::Unrelated);
            })
            .unwrap();
    }
}

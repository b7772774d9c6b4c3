//! Single-row backlog commands: folder edits, moves and outgoing mail.
//!
//! Rows are dispatched one at a time, oldest first, once every reference
//! they carry is a server id. A row-level failure removes the row and is
//! logged; it does not fail the session.

use crate::command::{Command, Outcome};
use crate::error::{SyncError, SyncResult};
use crate::reconcile::{rewrite_ref, resolve_created};
use crate::store::{ItemStore, ItemStoreExt, StoreTxn};
use groupsync_protocol::commands::{
    send_mail_status, FolderCommandRequest, FolderCommandResponse, MoveItemsRequest,
    MoveItemsResponse, OutgoingKind, SendMailRequest,
};
use groupsync_protocol::{
    Element, FolderCommandStatus, FolderType, ItemRef, MoveStatus, PendingKind, PendingOperation,
    ProtocolError, StatusDisposition,
};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Field holding the RFC 822 body of an outgoing message.
pub const MIME_FIELD: &str = "Mime";

/// Returns the oldest row that a [`PendingCommand`] can send now.
pub fn next_dispatchable(txn: &dyn StoreTxn) -> Option<PendingOperation> {
    txn.pending()
        .into_iter()
        .find(|op| !op.kind.is_sync_borne() && !op.is_dispatched() && op.is_dispatchable())
}

fn server_id(r: &ItemRef, what: &str) -> SyncResult<String> {
    r.server_id()
        .map(str::to_string)
        .ok_or_else(|| SyncError::HardFail(format!("{what} {r} has no server id yet")))
}

/// Sends one pending row.
pub struct PendingCommand {
    store: Arc<dyn ItemStore>,
    op: PendingOperation,
    root: &'static str,
}

impl PendingCommand {
    /// Claims `op` for dispatch.
    pub fn new(store: Arc<dyn ItemStore>, op: PendingOperation) -> Self {
        let root = match op.kind {
            PendingKind::FolderCreate => "FolderCreate",
            PendingKind::FolderUpdate => "FolderUpdate",
            PendingKind::FolderDelete => "FolderDelete",
            PendingKind::ItemMove => "MoveItems",
            PendingKind::Reply => "SmartReply",
            PendingKind::Forward => "SmartForward",
            _ => "SendMail",
        };
        Self { store, op, root }
    }

    /// Row being dispatched.
    pub fn op(&self) -> &PendingOperation {
        &self.op
    }

    fn document(&self, txn: &dyn StoreTxn) -> SyncResult<Element> {
        let op = &self.op;
        let cursor = txn.protocol_state().hierarchy_cursor;
        let doc = match op.kind {
            PendingKind::FolderCreate => FolderCommandRequest::Create {
                cursor,
                parent_id: server_id(&op.folder, "parent folder")?,
                display_name: op.display_name.clone().unwrap_or_default(),
                folder_type: op.folder_type.unwrap_or(FolderType::USER_GENERIC),
            }
            .to_element(),
            PendingKind::FolderUpdate => {
                let current = txn.folder(&op.target);
                FolderCommandRequest::Update {
                    cursor,
                    server_id: server_id(&op.target, "folder")?,
                    parent_id: server_id(op.dest_folder.as_ref().unwrap_or(&op.folder), "parent folder")?,
                    display_name: op
                        .display_name
                        .clone()
                        .or_else(|| current.map(|f| f.display_name))
                        .unwrap_or_default(),
                }
                .to_element()
            }
            PendingKind::FolderDelete => FolderCommandRequest::Delete {
                cursor,
                server_id: server_id(&op.target, "folder")?,
            }
            .to_element(),
            PendingKind::ItemMove => MoveItemsRequest {
                src_msg_id: server_id(&op.target, "item")?,
                src_fld_id: server_id(&op.folder, "source folder")?,
                dst_fld_id: server_id(
                    op.dest_folder
                        .as_ref()
                        .ok_or_else(|| SyncError::HardFail("move without destination".into()))?,
                    "destination folder",
                )?,
            }
            .to_element(),
            PendingKind::Send | PendingKind::Reply | PendingKind::Forward => {
                let source = || -> SyncResult<(String, String)> {
                    let item = op
                        .source
                        .as_ref()
                        .ok_or_else(|| SyncError::HardFail("reply without source".into()))?;
                    let folder = op.source_folder.as_ref().unwrap_or(&op.folder);
                    Ok((server_id(folder, "source folder")?, server_id(item, "source item")?))
                };
                let kind = match op.kind {
                    PendingKind::Reply => {
                        let (folder_id, item_id) = source()?;
                        OutgoingKind::Reply { folder_id, item_id }
                    }
                    PendingKind::Forward => {
                        let (folder_id, item_id) = source()?;
                        OutgoingKind::Forward { folder_id, item_id }
                    }
                    _ => OutgoingKind::Send,
                };
                SendMailRequest {
                    kind,
                    client_id: op.token.clone(),
                    save_in_sent: true,
                    mime: op.fields.get(MIME_FIELD).cloned().unwrap_or_default(),
                }
                .to_element()
            }
            kind => {
                return Err(SyncError::HardFail(format!(
                    "{kind:?} rows travel inside Sync"
                )))
            }
        };
        Ok(doc)
    }

    fn drop_row(&self, txn: &mut dyn StoreTxn, why: &str) {
        error!(id = self.op.id, kind = ?self.op.kind, target = %self.op.target, why, "pending row failed");
        txn.remove_pending(self.op.id);
    }

    fn folder_result(&self, txn: &mut dyn StoreTxn, response: FolderCommandResponse) -> Outcome {
        let status = response.status;
        match FolderCommandStatus::disposition(status) {
            StatusDisposition::Resync => {
                if let Some(mut op) = txn.pending_op(self.op.id) {
                    op.mark_queued();
                    txn.put_pending(op);
                }
                return Outcome::Resync(format!("{} status {status}", self.root));
            }
            StatusDisposition::HardFail => {
                self.drop_row(txn, "malformed request");
                return Outcome::Success;
            }
            _ => {}
        }
        if FolderCommandStatus::from_code(status) != Some(FolderCommandStatus::Success) {
            self.drop_row(txn, &format!("{} status {status}", self.root));
            return Outcome::Success;
        }

        txn.remove_pending(self.op.id);
        if let Some(cursor) = response.cursor {
            let mut state = txn.protocol_state();
            state.hierarchy_cursor = cursor;
            txn.set_protocol_state(state);
        }
        match self.op.kind {
            PendingKind::FolderCreate => match response.server_id {
                Some(id) => {
                    let mut report = Default::default();
                    resolve_created(txn, &self.op.target, &id, &mut report);
                    if let Some(mut folder) = txn.folder(&ItemRef::server(id)) {
                        folder.epoch = txn.protocol_state().epoch;
                        folder.client_owned = false;
                        folder.reset_cursor();
                        txn.put_folder(folder);
                    }
                }
                None => warn!(id = self.op.id, "FolderCreate succeeded without a server id"),
            },
            PendingKind::FolderUpdate => {
                if let Some(mut folder) = txn.folder(&self.op.target) {
                    if let Some(dest) = &self.op.dest_folder {
                        folder.parent = dest.clone();
                    }
                    if let Some(name) = &self.op.display_name {
                        folder.display_name = name.clone();
                    }
                    txn.put_folder(folder);
                }
            }
            _ => {}
        }
        Outcome::Success
    }

    fn move_result(&self, txn: &mut dyn StoreTxn, response: MoveItemsResponse) -> Outcome {
        let status = MoveStatus::from_code(response.status);
        if !status.is_some_and(MoveStatus::is_success) {
            self.drop_row(txn, &format!("MoveItems status {}", response.status));
            return Outcome::Success;
        }
        txn.remove_pending(self.op.id);
        if let Some(new_id) = response.dst_msg_id {
            let to = ItemRef::server(new_id);
            if to != self.op.target {
                rewrite_ref(txn, &self.op.target, &to);
            }
        }
        Outcome::Success
    }

    fn send_result(&self, txn: &mut dyn StoreTxn, status: Option<u32>) -> Outcome {
        match status {
            None | Some(1) => {
                txn.remove_pending(self.op.id);
                if self.op.target.is_client() {
                    txn.remove_item(&self.op.target);
                }
                info!(id = self.op.id, root = self.root, "message sent");
            }
            Some(code) => self.drop_row(txn, &format!("{} status {code}", self.root)),
        }
        Outcome::Success
    }
}

impl Command for PendingCommand {
    fn name(&self) -> &'static str {
        self.root
    }

    fn build_request(&mut self) -> SyncResult<Option<Element>> {
        let id = self.op.id;
        let doc = self.store.transaction(|txn| {
            let mut op = txn
                .pending_op(id)
                .ok_or_else(|| SyncError::store(format!("pending row {id} vanished")))?;
            let doc = self.document(&*txn)?;
            op.mark_dispatched();
            txn.put_pending(op);
            Ok(doc)
        });
        match doc {
            Ok(doc) => Ok(Some(doc)),
            Err(err @ SyncError::HardFail(_)) => {
                // The row can never be sent as it stands.
                let store = Arc::clone(&self.store);
                store.transaction(|txn| {
                    self.drop_row(txn, &err.to_string());
                    Ok(())
                })?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn process_response(&mut self, doc: Option<&Element>) -> SyncResult<Outcome> {
        let store = Arc::clone(&self.store);
        match self.op.kind {
            PendingKind::FolderCreate | PendingKind::FolderUpdate | PendingKind::FolderDelete => {
                let doc = doc.ok_or_else(|| ProtocolError::missing("response", self.root))?;
                let response = FolderCommandResponse::from_element(doc, self.root)?;
                store.transaction(|txn| Ok(self.folder_result(txn, response)))
            }
            PendingKind::ItemMove => {
                let doc = doc.ok_or_else(|| ProtocolError::missing("response", self.root))?;
                let response = MoveItemsResponse::from_element(doc)?;
                store.transaction(|txn| Ok(self.move_result(txn, response)))
            }
            _ => {
                // Outgoing mail answers with an empty body on success.
                let status = doc.map(send_mail_status).transpose()?.flatten();
                store.transaction(|txn| Ok(self.send_result(txn, status)))
            }
        }
    }

    fn on_abandon(&mut self) {
        let id = self.op.id;
        let result = self.store.transaction(|txn| {
            if let Some(mut op) = txn.pending_op(id) {
                op.mark_queued();
                txn.put_pending(op);
            }
            Ok(())
        });
        if let Err(err) = result {
            error!(%err, id, "could not requeue pending row");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use groupsync_protocol::{EntityClass, Fields, Folder, Item, SyncCursor};

    fn store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .transaction(|txn| {
                let mut state = txn.protocol_state();
                state.hierarchy_cursor = SyncCursor::new("3");
                txn.set_protocol_state(state);
                txn.put_folder(Folder::new(ItemRef::server("5"), ItemRef::root(), "Inbox", FolderType::INBOX, 1));
                txn.put_folder(Folder::new(ItemRef::server("9"), ItemRef::root(), "Archive", FolderType::USER_MAIL, 1));
                Ok(())
            })
            .unwrap();
        store
    }

    fn claim(store: &Arc<MemoryStore>, op: PendingOperation) -> PendingCommand {
        let op = store
            .transaction(|txn| {
                let id = txn.enqueue_pending(op);
                Ok(txn.pending_op(id).unwrap())
            })
            .unwrap();
        PendingCommand::new(Arc::clone(store) as Arc<dyn ItemStore>, op)
    }

    #[test]
    fn folder_create_rewrites_children() {
        let store = store();
        let temp = ItemRef::new_client();
        store
            .transaction(|txn| {
                let mut local = Folder::new(temp.clone(), ItemRef::root(), "Receipts", FolderType::USER_MAIL, 1);
                local.client_owned = true;
                txn.put_folder(local);
                Ok(())
            })
            .unwrap();
        let mut cmd = claim(
            &store,
            PendingOperation::new(PendingKind::FolderCreate, EntityClass::Folder, temp.clone(), ItemRef::root())
                .with_display_name("Receipts")
                .with_folder_type(FolderType::USER_MAIL),
        );
        let waiting = store
            .transaction(|txn| {
                Ok(txn.enqueue_pending(
                    PendingOperation::new(PendingKind::ItemMove, EntityClass::Email, ItemRef::server("5:1"), ItemRef::server("5"))
                        .with_dest_folder(temp.clone()),
                ))
            })
            .unwrap();
        assert!(store.read(|txn| next_dispatchable(txn).map(|op| op.id)).unwrap().is_some());

        let doc = cmd.build_request().unwrap().unwrap();
        assert_eq!(doc.name, "FolderCreate");
        assert_eq!(doc.child_text("SyncKey"), Some("3"));
        assert_eq!(cmd.name(), "FolderCreate");

        let reply = FolderCommandResponse {
            status: 1,
            cursor: Some(SyncCursor::new("4")),
            server_id: Some("40".into()),
        };
        assert_eq!(cmd.process_response(Some(&reply.to_element("FolderCreate"))).unwrap(), Outcome::Success);

        let (pending, folder, state) = store
            .read(|txn| (txn.pending(), txn.folder(&ItemRef::server("40")), txn.protocol_state()))
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, waiting);
        assert_eq!(pending[0].dest_folder, Some(ItemRef::server("40")));
        assert!(pending[0].is_dispatchable());
        let folder = folder.unwrap();
        assert!(!folder.client_owned);
        assert!(folder.sync_required);
        assert_eq!(state.hierarchy_cursor, SyncCursor::new("4"));
    }

    #[test]
    fn folder_status_failure_drops_row() {
        let store = store();
        let mut cmd = claim(
            &store,
            PendingOperation::new(PendingKind::FolderDelete, EntityClass::Folder, ItemRef::server("9"), ItemRef::root()),
        );
        cmd.build_request().unwrap();
        let reply = FolderCommandResponse {
            status: 4,
            cursor: None,
            server_id: None,
        };
        assert_eq!(cmd.process_response(Some(&reply.to_element("FolderDelete"))).unwrap(), Outcome::Success);
        assert!(store.read(|txn| txn.pending()).unwrap().is_empty());
    }

    #[test]
    fn folder_resync_keeps_row() {
        let store = store();
        let mut cmd = claim(
            &store,
            PendingOperation::new(PendingKind::FolderUpdate, EntityClass::Folder, ItemRef::server("9"), ItemRef::root())
                .with_display_name("Old"),
        );
        cmd.build_request().unwrap();
        let reply = FolderCommandResponse {
            status: 9,
            cursor: None,
            server_id: None,
        };
        let outcome = cmd.process_response(Some(&reply.to_element("FolderUpdate"))).unwrap();
        assert!(matches!(outcome, Outcome::Resync(_)));
        let pending = store.read(|txn| txn.pending()).unwrap();
        assert_eq!(pending.len(), 1);
        assert!(!pending[0].is_dispatched());
    }

    #[test]
    fn move_rewrites_item_id() {
        let store = store();
        store
            .transaction(|txn| {
                txn.put_item(Item::new(ItemRef::server("5:1"), EntityClass::Email, ItemRef::server("9"), Fields::new()));
                Ok(())
            })
            .unwrap();
        let mut cmd = claim(
            &store,
            PendingOperation::new(PendingKind::ItemMove, EntityClass::Email, ItemRef::server("5:1"), ItemRef::server("5"))
                .with_dest_folder(ItemRef::server("9")),
        );
        let doc = cmd.build_request().unwrap().unwrap();
        assert_eq!(doc.require("Move").unwrap().child_text("SrcFldId"), Some("5"));

        let reply = MoveItemsResponse {
            status: 3,
            src_msg_id: Some("5:1".into()),
            dst_msg_id: Some("9:7".into()),
        };
        cmd.process_response(Some(&reply.to_element())).unwrap();
        let (old, new) = store
            .read(|txn| (txn.item(&ItemRef::server("5:1")), txn.item(&ItemRef::server("9:7"))))
            .unwrap();
        assert!(old.is_none());
        assert!(new.is_some());
    }

    #[test]
    fn converted_reply_goes_out_as_send() {
        let store = store();
        let mut op = PendingOperation::new(PendingKind::Reply, EntityClass::Email, ItemRef::new_client(), ItemRef::server("5"))
            .with_source(ItemRef::server("5:1"), ItemRef::server("5"))
            .with_fields([(MIME_FIELD.to_string(), "Subject: re".to_string())].into_iter().collect());
        assert!(op.convert_to_send());
        let mut cmd = claim(&store, op);
        let doc = cmd.build_request().unwrap().unwrap();
        assert_eq!(doc.name, "SendMail");
        assert_eq!(cmd.name(), "SendMail");
        assert_eq!(doc.child_text("Mime"), Some("Subject: re"));

        assert_eq!(cmd.process_response(None).unwrap(), Outcome::Success);
        assert!(store.read(|txn| txn.pending()).unwrap().is_empty());
    }

    #[test]
    fn abandon_requeues_row() {
        let store = store();
        let mut cmd = claim(
            &store,
            PendingOperation::new(PendingKind::FolderDelete, EntityClass::Folder, ItemRef::server("9"), ItemRef::root()),
        );
        cmd.build_request().unwrap();
        assert!(store.read(|txn| next_dispatchable(txn)).unwrap().is_none());
        cmd.on_abandon();
        assert!(store.read(|txn| next_dispatchable(txn)).unwrap().is_some());
    }
}

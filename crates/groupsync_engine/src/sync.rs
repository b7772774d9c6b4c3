//! Sync: pulls item changes per folder and pushes sync-borne pending rows
//! in the same round trip.

use crate::command::{Command, Outcome};
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::reconcile::{apply_delta, resolve_created, ReconcileReport};
use crate::store::{ItemStore, ItemStoreExt, StoreTxn};
use groupsync_protocol::messages::{
    ClientCommand, CollectionOptions, CollectionRequest, SyncRequest, SyncResponse,
};
use groupsync_protocol::{
    DeltaKind, Element, EntityClass, Folder, ItemRef, PendingKind, PendingOperation, SyncStatus,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Returns true if `folder` has to be named in the next Sync request.
pub fn folder_wants_sync(folder: &Folder, pending: &[PendingOperation]) -> bool {
    folder.is_syncable() && (folder.sync_required || pending.iter().any(|op| is_pushable(op, folder)))
}

fn is_pushable(op: &PendingOperation, folder: &Folder) -> bool {
    op.kind.is_sync_borne()
        && !op.is_dispatched()
        && op.folder == folder.id
        && op.is_dispatchable()
        && !folder.cursor.is_initial()
}

fn client_command(op: &PendingOperation) -> Option<ClientCommand> {
    match op.kind {
        PendingKind::ItemCreate => match &op.target {
            ItemRef::Client(client_id) => Some(ClientCommand::Add {
                client_id: client_id.clone(),
                fields: op.fields.clone(),
            }),
            ItemRef::Server(_) => None,
        },
        PendingKind::ItemChange | PendingKind::MarkRead => Some(ClientCommand::Change {
            server_id: op.target.server_id()?.to_string(),
            fields: op.fields.clone(),
        }),
        PendingKind::ItemDelete => Some(ClientCommand::Delete {
            server_id: op.target.server_id()?.to_string(),
        }),
        _ => None,
    }
}

/// The Sync command.
pub struct SyncCommand {
    store: Arc<dyn ItemStore>,
    window_size: u32,
    email_filter: u32,
    body_preference: u32,
    dispatched: Vec<(u64, String)>,
    report: ReconcileReport,
}

impl SyncCommand {
    /// Creates the command.
    pub fn new(store: Arc<dyn ItemStore>, config: &SyncConfig) -> Self {
        Self {
            store,
            window_size: config.window_size,
            email_filter: config.email_filter,
            body_preference: config.body_preference,
            dispatched: Vec::new(),
            report: ReconcileReport::default(),
        }
    }

    /// What the last processed response did.
    pub fn report(&self) -> &ReconcileReport {
        &self.report
    }

    fn options_for(&self, class: Option<EntityClass>) -> CollectionOptions {
        match class {
            Some(EntityClass::Email) => CollectionOptions {
                filter_type: Some(self.email_filter),
                body_preference: Some(self.body_preference),
                truncation_size: None,
                mime_support: None,
            },
            _ => CollectionOptions {
                body_preference: Some(self.body_preference),
                ..CollectionOptions::default()
            },
        }
    }

    fn requeue(&mut self, txn: &mut dyn StoreTxn, collection: Option<&str>) {
        self.dispatched.retain(|(id, cid)| {
            if collection.is_some_and(|c| c != cid.as_str()) {
                return true;
            }
            if let Some(mut op) = txn.pending_op(*id) {
                op.mark_queued();
                txn.put_pending(op);
            }
            false
        });
    }

    fn resolve_dispatched(&mut self, txn: &mut dyn StoreTxn, collection: &str) {
        self.dispatched.retain(|(id, cid)| {
            if cid.as_str() != collection {
                return true;
            }
            txn.remove_pending(*id);
            false
        });
    }
}

impl Command for SyncCommand {
    fn name(&self) -> &'static str {
        "Sync"
    }

    fn build_request(&mut self) -> SyncResult<Option<Element>> {
        let window = self.window_size;
        let mut collections = Vec::new();
        let mut dispatched = Vec::new();
        self.store.transaction(|txn| {
            let pending = txn.pending();
            for folder in txn.folders() {
                if !folder_wants_sync(&folder, &pending) {
                    continue;
                }
                let Some(collection_id) = folder.id.server_id().map(str::to_string) else {
                    continue;
                };
                let mut request = CollectionRequest::new(collection_id.clone(), folder.cursor.clone());
                if !folder.cursor.is_initial() {
                    request.get_changes = true;
                    request.window_size = Some(window);
                    request.options = Some(self.options_for(folder.content_class()));
                    for mut op in pending.iter().filter(|op| is_pushable(op, &folder)).cloned() {
                        let Some(command) = client_command(&op) else {
                            continue;
                        };
                        request.commands.push(command);
                        op.mark_dispatched();
                        dispatched.push((op.id, collection_id.clone()));
                        txn.put_pending(op);
                    }
                }
                collections.push(request);
            }
            Ok(())
        })?;

        if collections.is_empty() {
            debug!("nothing to sync");
            return Ok(None);
        }
        info!(
            collections = collections.len(),
            pushed = dispatched.len(),
            "sync request built"
        );
        self.dispatched = dispatched;
        let request = SyncRequest {
            collections,
            window_size: Some(window),
        };
        Ok(Some(request.to_element()))
    }

    fn process_top_level_status(&mut self, status: u32) -> Option<Outcome> {
        Outcome::from_disposition(SyncStatus::top_level_disposition(status), "Sync", status)
    }

    fn process_response(&mut self, doc: Option<&Element>) -> SyncResult<Outcome> {
        let Some(doc) = doc else {
            // Nothing changed on the server side.
            let pushed = !self.dispatched.is_empty();
            let store = Arc::clone(&self.store);
            store.transaction(|txn| {
                self.requeue(txn, None);
                Ok(())
            })?;
            return Ok(if pushed { Outcome::SyncAgain } else { Outcome::Success });
        };

        let classes: HashMap<String, EntityClass> = self.store.read(|txn| {
            txn.folders()
                .into_iter()
                .filter_map(|f| Some((f.id.server_id()?.to_string(), f.content_class()?)))
                .collect()
        })?;
        let response = SyncResponse::from_element(doc, &|id: &str| classes.get(id).copied())?;

        let mut again = false;
        let mut resync = None;
        let mut report = ReconcileReport::default();
        let store = Arc::clone(&self.store);
        store.transaction(|txn| {
            let epoch = txn.protocol_state().epoch;
            for collection in &response.collections {
                let folder_ref = ItemRef::server(collection.collection_id.clone());
                let Some(mut folder) = txn.folder(&folder_ref) else {
                    warn!(collection = %collection.collection_id, "response for unknown collection");
                    continue;
                };
                match SyncStatus::from_code(collection.status) {
                    Some(SyncStatus::Success) => {}
                    Some(SyncStatus::SyncKeyInvalid) => {
                        warn!(collection = %collection.collection_id, "sync key rejected, starting folder over");
                        folder.reset_cursor();
                        txn.put_folder(folder);
                        self.requeue(txn, Some(&collection.collection_id));
                        again = true;
                        continue;
                    }
                    Some(SyncStatus::FolderChange) => {
                        self.requeue(txn, Some(&collection.collection_id));
                        resync = Some(format!("Sync collection {} status 12", collection.collection_id));
                        continue;
                    }
                    Some(SyncStatus::Retry | SyncStatus::ResendFull | SyncStatus::LimitReWait | SyncStatus::ServerError) => {
                        self.requeue(txn, Some(&collection.collection_id));
                        again = true;
                        continue;
                    }
                    _ => {
                        error!(
                            collection = %collection.collection_id,
                            status = collection.status,
                            "collection failed, dropping its pushed rows"
                        );
                        self.resolve_dispatched(txn, &collection.collection_id);
                        continue;
                    }
                }

                let first_sync = folder.cursor.is_initial();
                if let Some(cursor) = &collection.cursor {
                    folder.cursor = cursor.clone();
                }
                folder.sync_required = first_sync || collection.more_available;
                again |= folder.sync_required;
                txn.put_folder(folder);

                for reply in &collection.responses {
                    match (reply.kind, &reply.client_id, &reply.server_id, reply.status) {
                        (DeltaKind::Add, Some(client_id), Some(server_id), 1) => {
                            resolve_created(txn, &ItemRef::Client(client_id.clone()), server_id, &mut report);
                        }
                        (_, _, _, 1) => {}
                        (kind, client_id, server_id, status) => warn!(
                            ?kind,
                            client_id = client_id.as_deref().unwrap_or(""),
                            server_id = server_id.as_deref().unwrap_or(""),
                            status,
                            "server rejected pushed change"
                        ),
                    }
                }
                for delta in &collection.commands {
                    apply_delta(txn, delta, epoch, &mut report)?;
                }
                self.resolve_dispatched(txn, &collection.collection_id);
            }
            // Rows for collections the server did not answer go back in the queue.
            self.requeue(txn, None);
            Ok(())
        })?;

        info!(
            collections = response.collections.len(),
            applied = report.applied,
            skipped = report.skipped,
            rewritten = report.pending_rewritten,
            more = again,
            "sync response processed"
        );
        self.report = report;
        Ok(match resync {
            Some(why) => Outcome::Resync(why),
            None if again => Outcome::SyncAgain,
            None => Outcome::Success,
        })
    }

    fn on_abandon(&mut self) {
        if self.dispatched.is_empty() {
            return;
        }
        let store = Arc::clone(&self.store);
        let result = store.transaction(|txn| {
            self.requeue(txn, None);
            Ok(())
        });
        if let Err(err) = result {
            error!(%err, "could not requeue pushed rows");
        }
    }
}

/// Counts sync-borne rows waiting per folder, for diagnostics.
pub fn pending_by_folder(txn: &dyn StoreTxn) -> BTreeMap<ItemRef, usize> {
    let mut out = BTreeMap::new();
    for op in txn.pending().iter().filter(|op| op.kind.is_sync_borne()) {
        *out.entry(op.folder.clone()).or_insert(0) += 1;
    }
    out
}

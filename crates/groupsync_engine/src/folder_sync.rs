//! FolderSync: keeps the local folder tree in step with the server.
//!
//! Every folder the server reports is stamped with the account's current
//! hierarchy epoch. After a full refresh (epoch bumped, cursor reset), the
//! folders still carrying an older epoch are the ones the server silently
//! dropped; they are moved under the recovery folder instead of deleted.

use crate::command::{Command, Outcome};
use crate::error::{SyncError, SyncResult};
use crate::reconcile::{apply_delta, scrub_stale_folders, ReconcileReport};
use crate::store::{ItemStore, ItemStoreExt, StoreTxn};
use groupsync_protocol::messages::{FolderSyncRequest, FolderSyncResponse};
use groupsync_protocol::{Element, FolderSyncStatus, ProtocolError};
use std::sync::Arc;
use tracing::{info, warn};

/// The FolderSync command.
pub struct FolderSyncCommand {
    store: Arc<dyn ItemStore>,
    report: ReconcileReport,
}

impl FolderSyncCommand {
    /// Creates the command.
    pub fn new(store: Arc<dyn ItemStore>) -> Self {
        Self {
            store,
            report: ReconcileReport::default(),
        }
    }

    /// What the last processed response did.
    pub fn report(&self) -> &ReconcileReport {
        &self.report
    }
}

/// Bumps the hierarchy epoch and resets the hierarchy cursor, so the next
/// FolderSync re-derives the whole tree and scrubs what it no longer lists.
pub fn begin_full_refresh(txn: &mut dyn StoreTxn) -> u64 {
    let mut state = txn.protocol_state();
    let epoch = state.begin_full_refresh();
    txn.set_protocol_state(state);
    warn!(epoch, "full folder hierarchy refresh scheduled");
    epoch
}

impl Command for FolderSyncCommand {
    fn name(&self) -> &'static str {
        "FolderSync"
    }

    fn build_request(&mut self) -> SyncResult<Option<Element>> {
        let cursor = self.store.read(|txn| txn.protocol_state().hierarchy_cursor)?;
        Ok(Some(FolderSyncRequest::new(cursor).to_element()))
    }

    fn process_top_level_status(&mut self, status: u32) -> Option<Outcome> {
        Outcome::from_disposition(FolderSyncStatus::disposition(status), "FolderSync", status)
    }

    fn process_response(&mut self, doc: Option<&Element>) -> SyncResult<Outcome> {
        let doc = doc.ok_or_else(|| SyncError::Protocol(ProtocolError::missing("response", "FolderSync")))?;
        let response = FolderSyncResponse::from_element(doc)?;
        if let Some(outcome) = self.process_top_level_status(response.status) {
            return Ok(outcome);
        }
        let cursor = response
            .cursor
            .clone()
            .ok_or_else(|| ProtocolError::missing("FolderSync", "SyncKey"))?;

        let (report, scrubbed) = self.store.transaction(|txn| {
            let mut state = txn.protocol_state();
            let mut report = ReconcileReport::default();
            for delta in &response.changes {
                apply_delta(txn, delta, state.epoch, &mut report)?;
            }
            let scrubbed = if state.scrub_needed {
                state.scrub_needed = false;
                scrub_stale_folders(txn, state.epoch)
            } else {
                0
            };
            state.hierarchy_cursor = cursor.clone();
            txn.set_protocol_state(state);
            Ok((report, scrubbed))
        })?;

        info!(
            changes = response.changes.len(),
            applied = report.applied,
            skipped = report.skipped,
            scrubbed,
            cursor = cursor.as_str(),
            "folder hierarchy synced"
        );
        self.report = report;
        Ok(Outcome::Success)
    }
}

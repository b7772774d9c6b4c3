//! # groupsync Engine
//!
//! State-machine driven sync engine for groupware accounts.
//!
//! This crate provides:
//! - A table-driven FSM core ([`fsm`]) with cross-task posting ([`Poster`])
//!   and cancellable timers ([`Timer`])
//! - An HTTP transport machine with retry, server-directed delay,
//!   relocation and status classification ([`Transport`])
//! - FolderSync, Sync and single-row backlog commands
//! - Conflict reconciliation between server deltas and the local
//!   pending backlog ([`reconcile`])
//! - A per-account control machine picking what to run next
//!   ([`ProtocolControl`])
//!
//! ## Architecture
//!
//! Every machine lives on its own tokio task and is reached only through
//! posted events. The control starts one transport machine per round trip;
//! the transport owns the command until the round trip ends and reports
//! back with a [`TransportReport`].
//!
//! ## Key Invariants
//!
//! - Actions never nest; events posted from an action run after it returns
//! - A cancelled round trip never reports
//! - Pending rows leave the backlog in id order
//! - Server state wins a conflict unless the client edit is a delete
//! - Folders the server stops listing are rescued, never deleted

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod classify;
mod command;
mod config;
mod control;
mod dispatch;
mod edits;
mod error;
mod folder_sync;
pub mod fsm;
mod http;
mod mailbox;
pub mod reconcile;
mod reqwest_client;
mod store;
mod sync;
mod timer;
mod transport;

pub use classify::{
    classify, rule_for, Disposition, StatusRule, RETRY_AFTER, X_MS_ASTHROTTLE, X_MS_CREDENTIALS_EXPIRE,
    X_MS_LOCATION, X_MS_RP,
};
pub use command::{Command, Outcome};
pub use config::{AccountConfig, SyncConfig, TransportConfig};
pub use control::{control_table, ControlHandle, ControlStatus, Phase, ProtocolControl};
pub use dispatch::{next_dispatchable, PendingCommand, MIME_FIELD};
pub use edits::{LocalEdits, READ_FIELD};
pub use error::{SyncError, SyncResult};
pub use folder_sync::{begin_full_refresh, FolderSyncCommand};
pub use http::{http_table, ReportSink, Session, Transport, TransportHandle, TransportReport};
pub use mailbox::{mailbox, Mailbox, Poster};
pub use reconcile::ReconcileReport;
pub use reqwest_client::ReqwestClient;
pub use store::{ItemStore, ItemStoreExt, MemoryStore, StoreTxn};
pub use sync::{folder_wants_sync, pending_by_folder, SyncCommand};
pub use timer::Timer;
pub use transport::{
    Headers, HttpClient, HttpRequest, HttpResponse, MockHttpClient, MockReply, RecordedRequest, TransportFault,
};

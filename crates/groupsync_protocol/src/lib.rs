//! # groupsync Protocol
//!
//! Wire documents and data model for the groupsync engine.
//!
//! This crate provides:
//! - [`Element`] document trees and the [`DocumentCodec`] seam, with a
//!   plain-XML codec ([`XmlCodec`])
//! - Sync and FolderSync request/response documents
//! - Single-row backlog command documents (folder edits, moves, outgoing mail)
//! - Application status tables mapped to a [`StatusDisposition`]
//! - Folders, items, pending operations, server deltas and sync cursors
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod commands;
mod cursor;
mod delta;
mod document;
mod error;
pub mod messages;
mod model;
mod pending;
mod status;

pub use cursor::SyncCursor;
pub use delta::{DeltaKind, ServerDelta};
pub use document::{DocumentCodec, Element, XmlCodec, WBXML_CONTENT_TYPE, XML_CONTENT_TYPE};
pub use error::{ProtocolError, ProtocolResult};
pub use model::{EntityClass, Fields, Folder, FolderType, Item, ItemRef, ProtocolState};
pub use pending::{ConvertedFrom, DispatchState, PendingKind, PendingOperation};
pub use status::{
    FolderCommandStatus, FolderSyncStatus, MoveStatus, StatusDisposition, SyncStatus,
};

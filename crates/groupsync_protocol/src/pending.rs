//! Pending operations: the local backlog of edits awaiting a round trip.

use crate::model::{EntityClass, Fields, FolderType, ItemRef};
use serde::{Deserialize, Serialize};

/// Kind of queued local edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PendingKind {
    /// Item created locally.
    ItemCreate,
    /// Item fields changed locally.
    ItemChange,
    /// Item deleted locally.
    ItemDelete,
    /// Mail marked read or unread.
    MarkRead,
    /// Item moved to another folder.
    ItemMove,
    /// New outgoing message.
    Send,
    /// Reply to an existing message.
    Reply,
    /// Forward of an existing message.
    Forward,
    /// Folder created locally.
    FolderCreate,
    /// Folder renamed or moved.
    FolderUpdate,
    /// Folder deleted locally.
    FolderDelete,
}

impl PendingKind {
    /// Converts to a numeric code for persistence.
    pub fn to_code(&self) -> u8 {
        match self {
            PendingKind::ItemCreate => 1,
            PendingKind::ItemChange => 2,
            PendingKind::ItemDelete => 3,
            PendingKind::MarkRead => 4,
            PendingKind::ItemMove => 5,
            PendingKind::Send => 6,
            PendingKind::Reply => 7,
            PendingKind::Forward => 8,
            PendingKind::FolderCreate => 9,
            PendingKind::FolderUpdate => 10,
            PendingKind::FolderDelete => 11,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(PendingKind::ItemCreate),
            2 => Some(PendingKind::ItemChange),
            3 => Some(PendingKind::ItemDelete),
            4 => Some(PendingKind::MarkRead),
            5 => Some(PendingKind::ItemMove),
            6 => Some(PendingKind::Send),
            7 => Some(PendingKind::Reply),
            8 => Some(PendingKind::Forward),
            9 => Some(PendingKind::FolderCreate),
            10 => Some(PendingKind::FolderUpdate),
            11 => Some(PendingKind::FolderDelete),
            _ => None,
        }
    }

    /// Rows of these kinds ride inside Sync requests.
    pub fn is_sync_borne(&self) -> bool {
        matches!(
            self,
            PendingKind::ItemCreate
                | PendingKind::ItemChange
                | PendingKind::ItemDelete
                | PendingKind::MarkRead
        )
    }

    /// Returns true for hierarchy edits.
    pub fn is_folder_op(&self) -> bool {
        matches!(
            self,
            PendingKind::FolderCreate | PendingKind::FolderUpdate | PendingKind::FolderDelete
        )
    }

    /// Returns true for outgoing mail.
    pub fn is_outgoing(&self) -> bool {
        matches!(self, PendingKind::Send | PendingKind::Reply | PendingKind::Forward)
    }

    /// Returns true if the row's target only exists under a client id until
    /// the server acknowledges it.
    pub fn creates_target(&self) -> bool {
        matches!(
            self,
            PendingKind::ItemCreate | PendingKind::FolderCreate | PendingKind::Send | PendingKind::Reply | PendingKind::Forward
        )
    }
}

/// Whether a row has been put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchState {
    /// Waiting for a round trip.
    Queued,
    /// Included in a request whose response has not been processed yet.
    Dispatched,
}

/// Record of a reply/forward that was downgraded to a plain send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertedFrom {
    /// Kind before conversion.
    pub kind: PendingKind,
    /// The message it replied to or forwarded.
    pub source: ItemRef,
}

/// One row of the pending backlog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Store-assigned id; rows are dispatched in id order.
    pub id: u64,
    /// Resolution token handed to the UI.
    pub token: String,
    /// What the row does.
    pub kind: PendingKind,
    /// Entity class of the target.
    pub class: EntityClass,
    /// Item or folder the row acts on.
    pub target: ItemRef,
    /// Folder holding the target (for folder ops, the parent).
    pub folder: ItemRef,
    /// Destination folder for moves.
    pub dest_folder: Option<ItemRef>,
    /// Folder display name for hierarchy edits.
    pub display_name: Option<String>,
    /// Folder type for FolderCreate.
    pub folder_type: Option<FolderType>,
    /// Fields to push.
    pub fields: Fields,
    /// Message a reply/forward refers to.
    pub source: Option<ItemRef>,
    /// Folder of `source`.
    pub source_folder: Option<ItemRef>,
    /// Set when a reply/forward was converted to a plain send.
    pub converted_from: Option<ConvertedFrom>,
    /// Dispatch state.
    pub state: DispatchState,
}

impl PendingOperation {
    /// Creates a queued row.
    pub fn new(kind: PendingKind, class: EntityClass, target: ItemRef, folder: ItemRef) -> Self {
        Self {
            id: 0,
            token: uuid::Uuid::new_v4().to_string(),
            kind,
            class,
            target,
            folder,
            dest_folder: None,
            display_name: None,
            folder_type: None,
            fields: Fields::new(),
            source: None,
            source_folder: None,
            converted_from: None,
            state: DispatchState::Queued,
        }
    }

    /// Sets the destination folder.
    pub fn with_dest_folder(mut self, dest: ItemRef) -> Self {
        self.dest_folder = Some(dest);
        self
    }

    /// Sets the folder display name.
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Sets the folder type.
    pub fn with_folder_type(mut self, folder_type: FolderType) -> Self {
        self.folder_type = Some(folder_type);
        self
    }

    /// Sets the fields.
    pub fn with_fields(mut self, fields: Fields) -> Self {
        self.fields = fields;
        self
    }

    /// Sets the source message of a reply/forward.
    pub fn with_source(mut self, source: ItemRef, source_folder: ItemRef) -> Self {
        self.source = Some(source);
        self.source_folder = Some(source_folder);
        self
    }

    fn refs_mut(&mut self) -> impl Iterator<Item = &mut ItemRef> {
        std::iter::once(&mut self.target)
            .chain(std::iter::once(&mut self.folder))
            .chain(self.dest_folder.iter_mut())
            .chain(self.source.iter_mut())
            .chain(self.source_folder.iter_mut())
    }

    fn refs(&self) -> impl Iterator<Item = &ItemRef> {
        std::iter::once(&self.target)
            .chain(std::iter::once(&self.folder))
            .chain(self.dest_folder.iter())
            .chain(self.source.iter())
            .chain(self.source_folder.iter())
    }

    /// Returns true if any reference of the row points at `r`.
    pub fn references(&self, r: &ItemRef) -> bool {
        self.refs().any(|x| x == r)
    }

    /// Replaces every occurrence of `from` by `to`. Returns true if
    /// anything changed.
    pub fn rewrite_ref(&mut self, from: &ItemRef, to: &ItemRef) -> bool {
        let mut changed = false;
        for r in self.refs_mut() {
            if r == from {
                *r = to.clone();
                changed = true;
            }
        }
        changed
    }

    /// Returns true once every reference the request needs is a server id.
    /// The target of a create may stay a client id; it becomes the
    /// request's client id.
    pub fn is_dispatchable(&self) -> bool {
        let skip_target = self.kind.creates_target();
        self.refs()
            .enumerate()
            .filter(|(i, _)| !(skip_target && *i == 0))
            .all(|(_, r)| !r.is_client())
    }

    /// Downgrades a reply/forward to a plain send, remembering what it was.
    pub fn convert_to_send(&mut self) -> bool {
        if !matches!(self.kind, PendingKind::Reply | PendingKind::Forward) {
            return false;
        }
        if let Some(source) = self.source.take() {
            self.converted_from = Some(ConvertedFrom {
                kind: self.kind,
                source,
            });
        }
        self.source_folder = None;
        self.kind = PendingKind::Send;
        true
    }

    /// Marks the row as on the wire.
    pub fn mark_dispatched(&mut self) {
        self.state = DispatchState::Dispatched;
    }

    /// Puts the row back in the queue.
    pub fn mark_queued(&mut self) {
        self.state = DispatchState::Queued;
    }

    /// Returns true if the row is on the wire.
    pub fn is_dispatched(&self) -> bool {
        self.state == DispatchState::Dispatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn kind_classification() {
        assert!(PendingKind::ItemDelete.is_sync_borne());
        assert!(!PendingKind::ItemMove.is_sync_borne());
        assert!(PendingKind::FolderUpdate.is_folder_op());
        assert!(PendingKind::Forward.is_outgoing());
        assert!(PendingKind::FolderCreate.creates_target());
        assert!(!PendingKind::ItemChange.creates_target());
    }

    #[test]
    fn rewrite_touches_every_reference() {
        let temp = ItemRef::new_client();
        let mut op = PendingOperation::new(
            PendingKind::ItemMove,
            EntityClass::Email,
            ItemRef::server("m1"),
            temp.clone(),
        )
        .with_dest_folder(temp.clone());

        assert!(op.references(&temp));
        assert!(!op.is_dispatchable());
        assert!(op.rewrite_ref(&temp, &ItemRef::server("f9")));
        assert!(!op.references(&temp));
        assert_eq!(op.folder, ItemRef::server("f9"));
        assert_eq!(op.dest_folder, Some(ItemRef::server("f9")));
        assert!(op.is_dispatchable());
        assert!(!op.rewrite_ref(&temp, &ItemRef::server("f9")));
    }

    #[test]
    fn create_target_may_stay_client() {
        let op = PendingOperation::new(
            PendingKind::ItemCreate,
            EntityClass::Calendar,
            ItemRef::new_client(),
            ItemRef::server("cal"),
        );
        assert!(op.is_dispatchable());

        let op = PendingOperation::new(
            PendingKind::ItemCreate,
            EntityClass::Calendar,
            ItemRef::new_client(),
            ItemRef::new_client(),
        );
        assert!(!op.is_dispatchable());
    }

    #[test]
    fn reply_converts_to_send() {
        let source = ItemRef::server("orig");
        let mut op = PendingOperation::new(
            PendingKind::Reply,
            EntityClass::Email,
            ItemRef::new_client(),
            ItemRef::server("outbox"),
        )
        .with_source(source.clone(), ItemRef::server("inbox"));

        assert!(op.convert_to_send());
        assert_eq!(op.kind, PendingKind::Send);
        assert_eq!(op.source, None);
        assert_eq!(
            op.converted_from,
            Some(ConvertedFrom {
                kind: PendingKind::Reply,
                source
            })
        );
        assert!(!op.convert_to_send());
    }

    #[test]
    fn dispatch_state_transitions() {
        let mut op = PendingOperation::new(
            PendingKind::ItemDelete,
            EntityClass::Email,
            ItemRef::server("m"),
            ItemRef::server("inbox"),
        );
        assert!(!op.is_dispatched());
        op.mark_dispatched();
        assert!(op.is_dispatched());
        op.mark_queued();
        assert_eq!(op.state, DispatchState::Queued);
    }

    proptest! {
        #[test]
        fn kind_code_roundtrip(code in 0u8..=20) {
            if let Some(kind) = PendingKind::from_code(code) {
                prop_assert_eq!(kind.to_code(), code);
            } else {
                prop_assert!(code == 0 || code > 11);
            }
        }
    }
}

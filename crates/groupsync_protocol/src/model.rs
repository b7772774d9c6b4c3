//! Folders, items and per-account protocol state.

use crate::cursor::SyncCursor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Reference to a folder or item.
///
/// Objects created locally carry a client-generated temporary id until the
/// server echoes them back with a real one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ItemRef {
    /// Server-assigned id.
    Server(String),
    /// Client-generated temporary id.
    Client(String),
}

impl ItemRef {
    /// Server id of the hierarchy root.
    pub const ROOT_ID: &'static str = "0";

    /// Reference to a server-known object.
    pub fn server(id: impl Into<String>) -> Self {
        Self::Server(id.into())
    }

    /// Fresh client temporary id.
    pub fn new_client() -> Self {
        Self::Client(uuid::Uuid::new_v4().to_string())
    }

    /// The hierarchy root.
    pub fn root() -> Self {
        Self::Server(Self::ROOT_ID.to_string())
    }

    /// Returns the server id, if known.
    pub fn server_id(&self) -> Option<&str> {
        match self {
            ItemRef::Server(id) => Some(id),
            ItemRef::Client(_) => None,
        }
    }

    /// Returns true for client temporary ids.
    pub fn is_client(&self) -> bool {
        matches!(self, ItemRef::Client(_))
    }

    /// Returns true for the hierarchy root.
    pub fn is_root(&self) -> bool {
        matches!(self, ItemRef::Server(id) if id == Self::ROOT_ID)
    }
}

impl fmt::Display for ItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemRef::Server(id) => write!(f, "{id}"),
            ItemRef::Client(id) => write!(f, "client:{id}"),
        }
    }
}

/// Kind of entity, selected on the wire by a class-code tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityClass {
    /// Mail messages.
    Email,
    /// Contacts.
    Contact,
    /// Calendar events.
    Calendar,
    /// Tasks.
    Task,
    /// Folders in the hierarchy.
    Folder,
}

impl EntityClass {
    /// Wire class code. Folders have none on the wire; `"Folder"` is
    /// used internally.
    pub fn class_code(self) -> &'static str {
        match self {
            EntityClass::Email => "Email",
            EntityClass::Contact => "Contacts",
            EntityClass::Calendar => "Calendar",
            EntityClass::Task => "Tasks",
            EntityClass::Folder => "Folder",
        }
    }

    /// Parses a wire class code.
    pub fn from_class_code(code: &str) -> Option<Self> {
        match code {
            "Email" => Some(EntityClass::Email),
            "Contacts" => Some(EntityClass::Contact),
            "Calendar" => Some(EntityClass::Calendar),
            "Tasks" => Some(EntityClass::Task),
            "Folder" => Some(EntityClass::Folder),
            _ => None,
        }
    }

    /// All item classes (everything except folders).
    pub const ITEMS: [EntityClass; 4] = [
        EntityClass::Email,
        EntityClass::Contact,
        EntityClass::Calendar,
        EntityClass::Task,
    ];
}

/// Folder type code from the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FolderType(pub u32);

impl FolderType {
    /// User-created generic folder.
    pub const USER_GENERIC: FolderType = FolderType(1);
    /// Default inbox.
    pub const INBOX: FolderType = FolderType(2);
    /// Default drafts.
    pub const DRAFTS: FolderType = FolderType(3);
    /// Default deleted items.
    pub const DELETED: FolderType = FolderType(4);
    /// Default sent items.
    pub const SENT: FolderType = FolderType(5);
    /// Default outbox.
    pub const OUTBOX: FolderType = FolderType(6);
    /// Default tasks.
    pub const TASKS: FolderType = FolderType(7);
    /// Default calendar.
    pub const CALENDAR: FolderType = FolderType(8);
    /// Default contacts.
    pub const CONTACTS: FolderType = FolderType(9);
    /// User-created mail folder.
    pub const USER_MAIL: FolderType = FolderType(12);
    /// User-created calendar.
    pub const USER_CALENDAR: FolderType = FolderType(13);
    /// User-created contacts folder.
    pub const USER_CONTACTS: FolderType = FolderType(14);
    /// User-created tasks folder.
    pub const USER_TASKS: FolderType = FolderType(15);

    /// Class of the items this folder holds, if it is synced at all.
    pub fn content_class(self) -> Option<EntityClass> {
        match self.0 {
            1..=6 | 12 => Some(EntityClass::Email),
            7 | 15 => Some(EntityClass::Task),
            8 | 13 => Some(EntityClass::Calendar),
            9 | 14 => Some(EntityClass::Contact),
            _ => None,
        }
    }
}

/// Flat field map carried by items and pending rows.
///
/// Nested wire elements are flattened with `.` separated paths, e.g.
/// `Body.Data`.
pub type Fields = BTreeMap<String, String>;

/// A folder in the local hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    /// Folder id.
    pub id: ItemRef,
    /// Parent folder (the root for top-level folders).
    pub parent: ItemRef,
    /// Display name.
    pub display_name: String,
    /// Type code.
    pub folder_type: FolderType,
    /// Per-folder sync cursor.
    pub cursor: SyncCursor,
    /// True while the folder has server changes to fetch.
    pub sync_required: bool,
    /// Hierarchy epoch at which the server last reported this folder.
    pub epoch: u64,
    /// Client-owned folders never come from the server and are never
    /// garbage-collected.
    pub client_owned: bool,
}

impl Folder {
    /// Client id of the recovery folder.
    pub const RECOVERY_ID: &'static str = "lost+found";
    /// Display name of the recovery folder.
    pub const RECOVERY_NAME: &'static str = "Lost and Found";

    /// Creates a server-side folder seen at `epoch`.
    pub fn new(
        id: ItemRef,
        parent: ItemRef,
        display_name: impl Into<String>,
        folder_type: FolderType,
        epoch: u64,
    ) -> Self {
        let sync_required = folder_type.content_class().is_some();
        Self {
            id,
            parent,
            display_name: display_name.into(),
            folder_type,
            cursor: SyncCursor::initial(),
            sync_required,
            epoch,
            client_owned: false,
        }
    }

    /// Reference of the recovery ("lost and found") folder.
    pub fn recovery_ref() -> ItemRef {
        ItemRef::Client(Self::RECOVERY_ID.to_string())
    }

    /// The recovery folder itself.
    pub fn recovery() -> Self {
        Self {
            id: Self::recovery_ref(),
            parent: ItemRef::root(),
            display_name: Self::RECOVERY_NAME.to_string(),
            folder_type: FolderType::USER_GENERIC,
            cursor: SyncCursor::initial(),
            sync_required: false,
            epoch: 0,
            client_owned: true,
        }
    }

    /// Returns true if Sync requests should cover this folder.
    pub fn is_syncable(&self) -> bool {
        !self.client_owned && !self.id.is_client() && self.folder_type.content_class().is_some()
    }

    /// Class of item this folder holds.
    pub fn content_class(&self) -> Option<EntityClass> {
        self.folder_type.content_class()
    }

    /// Forgets the cursor so the next Sync starts from scratch.
    pub fn reset_cursor(&mut self) {
        self.cursor = SyncCursor::initial();
        self.sync_required = self.is_syncable();
    }
}

/// A stored item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Item id.
    pub id: ItemRef,
    /// Entity class.
    pub class: EntityClass,
    /// Owning folder.
    pub folder: ItemRef,
    /// Item fields.
    pub fields: Fields,
}

impl Item {
    /// Creates an item.
    pub fn new(id: ItemRef, class: EntityClass, folder: ItemRef, fields: Fields) -> Self {
        Self {
            id,
            class,
            folder,
            fields,
        }
    }

    /// Returns a field value.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Per-account protocol state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolState {
    /// Folder-hierarchy epoch. Starts at 1.
    pub epoch: u64,
    /// Hierarchy sync cursor.
    pub hierarchy_cursor: SyncCursor,
    /// Set when the epoch was bumped and stale folders still need relocating.
    pub scrub_needed: bool,
    /// Device policy key, once provisioned.
    pub policy_key: Option<String>,
    /// Negotiated protocol version.
    pub protocol_version: String,
    /// Endpoint learned from a redirect, if any.
    pub endpoint: Option<String>,
}

impl ProtocolState {
    /// Protocol version used until the server says otherwise.
    pub const DEFAULT_VERSION: &'static str = "12.1";

    /// Bumps the epoch and forgets the hierarchy cursor.
    pub fn begin_full_refresh(&mut self) -> u64 {
        self.epoch += 1;
        self.hierarchy_cursor = SyncCursor::initial();
        self.scrub_needed = true;
        self.epoch
    }
}

impl Default for ProtocolState {
    fn default() -> Self {
        Self {
            epoch: 1,
            hierarchy_cursor: SyncCursor::initial(),
            scrub_needed: false,
            policy_key: None,
            protocol_version: Self::DEFAULT_VERSION.to_string(),
            endpoint: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_codes_roundtrip() {
        for class in EntityClass::ITEMS {
            assert_eq!(EntityClass::from_class_code(class.class_code()), Some(class));
        }
        assert_eq!(EntityClass::from_class_code("Notes"), None);
    }

    #[test]
    fn folder_type_classes() {
        assert_eq!(FolderType::INBOX.content_class(), Some(EntityClass::Email));
        assert_eq!(FolderType::USER_MAIL.content_class(), Some(EntityClass::Email));
        assert_eq!(FolderType::CALENDAR.content_class(), Some(EntityClass::Calendar));
        assert_eq!(FolderType::USER_TASKS.content_class(), Some(EntityClass::Task));
        assert_eq!(FolderType::CONTACTS.content_class(), Some(EntityClass::Contact));
        assert_eq!(FolderType(10).content_class(), None);
    }

    #[test]
    fn recovery_folder_is_client_owned() {
        let laf = Folder::recovery();
        assert!(laf.client_owned);
        assert!(!laf.is_syncable());
        assert!(laf.parent.is_root());
        assert_eq!(laf.id, Folder::recovery_ref());
    }

    #[test]
    fn new_folder_needs_sync_only_when_syncable() {
        let inbox = Folder::new(ItemRef::server("5"), ItemRef::root(), "Inbox", FolderType::INBOX, 1);
        assert!(inbox.sync_required);
        let notes = Folder::new(ItemRef::server("6"), ItemRef::root(), "Notes", FolderType(10), 1);
        assert!(!notes.sync_required);
    }

    #[test]
    fn protocol_state_epoch_bump() {
        let mut state = ProtocolState::default();
        assert_eq!(state.epoch, 1);
        state.hierarchy_cursor = SyncCursor::new("7");
        assert_eq!(state.begin_full_refresh(), 2);
        assert!(state.hierarchy_cursor.is_initial());
        assert!(state.scrub_needed);
    }

    #[test]
    fn item_ref_helpers() {
        assert!(ItemRef::root().is_root());
        assert!(ItemRef::new_client().is_client());
        assert_eq!(ItemRef::server("9").server_id(), Some("9"));
        assert_ne!(ItemRef::new_client(), ItemRef::new_client());
    }
}

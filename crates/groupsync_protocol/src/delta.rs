//! Changes reported by the server.

use crate::model::{EntityClass, Fields, FolderType, ItemRef};

/// Kind of server change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeltaKind {
    /// Object created on the server (or echoed back after a client create).
    Add,
    /// Object changed; for folders this covers rename and move.
    Change,
    /// Object removed.
    Delete,
}

/// One server-reported change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDelta {
    /// Kind of change.
    pub kind: DeltaKind,
    /// Entity class.
    pub class: EntityClass,
    /// Server-assigned id.
    pub server_id: String,
    /// Parent folder (server id).
    pub parent_id: String,
    /// Client id echoed back for a client-originated create.
    pub client_id: Option<String>,
    /// Item fields; empty for deletes.
    pub fields: Fields,
    /// Folder display name (folders only).
    pub display_name: Option<String>,
    /// Folder type (folders only).
    pub folder_type: Option<FolderType>,
}

impl ServerDelta {
    /// Creates an item delta.
    pub fn item(
        kind: DeltaKind,
        class: EntityClass,
        server_id: impl Into<String>,
        parent_id: impl Into<String>,
        fields: Fields,
    ) -> Self {
        Self {
            kind,
            class,
            server_id: server_id.into(),
            parent_id: parent_id.into(),
            client_id: None,
            fields,
            display_name: None,
            folder_type: None,
        }
    }

    /// Creates a folder delta.
    pub fn folder(
        kind: DeltaKind,
        server_id: impl Into<String>,
        parent_id: impl Into<String>,
        display_name: Option<String>,
        folder_type: Option<FolderType>,
    ) -> Self {
        Self {
            kind,
            class: EntityClass::Folder,
            server_id: server_id.into(),
            parent_id: parent_id.into(),
            client_id: None,
            fields: Fields::new(),
            display_name,
            folder_type,
        }
    }

    /// Sets the echoed client id.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Reference to the object the delta is about.
    pub fn target(&self) -> ItemRef {
        ItemRef::server(self.server_id.clone())
    }

    /// Reference to the parent folder.
    pub fn parent(&self) -> ItemRef {
        ItemRef::server(self.parent_id.clone())
    }

    /// Returns true for folder deltas.
    pub fn is_folder(&self) -> bool {
        self.class == EntityClass::Folder
    }
}

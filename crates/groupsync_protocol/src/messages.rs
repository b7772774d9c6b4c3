//! Sync and FolderSync request/response documents.
//!
//! Each message converts to an [`Element`] tree and back. Builders are used
//! by the engine for requests; parsers for responses. Both directions exist
//! so tests and tooling can fabricate server replies.

use crate::cursor::SyncCursor;
use crate::delta::{DeltaKind, ServerDelta};
use crate::document::Element;
use crate::error::{ProtocolError, ProtocolResult};
use crate::model::{EntityClass, Fields, FolderType};

/// Namespace of Sync documents.
pub const AIRSYNC_NS: &str = "AirSync";
/// Namespace of hierarchy documents.
pub const FOLDER_HIERARCHY_NS: &str = "FolderHierarchy";

/// Flattens an element's children into a field map.
pub fn fields_from_element(element: &Element) -> Fields {
    fn walk(prefix: &str, element: &Element, out: &mut Fields) {
        for child in &element.children {
            let key = if prefix.is_empty() {
                child.name.clone()
            } else {
                format!("{prefix}.{}", child.name)
            };
            if child.children.is_empty() {
                out.insert(key, child.text.clone().unwrap_or_default());
            } else {
                walk(&key, child, out);
            }
        }
    }

    let mut fields = Fields::new();
    walk("", element, &mut fields);
    fields
}

/// Rebuilds an element named `name` from a flattened field map.
pub fn fields_to_element(name: &str, fields: &Fields) -> Element {
    let mut root = Element::new(name);
    for (path, value) in fields {
        let mut node = &mut root;
        let mut parts = path.split('.').peekable();
        while let Some(part) = parts.next() {
            let last = parts.peek().is_none();
            let pos = node.children.iter().position(|c| c.name == part);
            let idx = match pos {
                Some(i) if !last => i,
                _ => {
                    node.push(Element::new(part));
                    node.children.len() - 1
                }
            };
            node = &mut node.children[idx];
            if last {
                node.text = Some(value.clone());
            }
        }
    }
    root
}

/// Hierarchy sync request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderSyncRequest {
    /// Current hierarchy cursor.
    pub cursor: SyncCursor,
}

impl FolderSyncRequest {
    /// Creates a request.
    pub fn new(cursor: SyncCursor) -> Self {
        Self { cursor }
    }

    /// Builds the document.
    pub fn to_element(&self) -> Element {
        Element::new("FolderSync")
            .with_namespace(FOLDER_HIERARCHY_NS)
            .with_leaf("SyncKey", self.cursor.as_str())
    }

    /// Parses the document.
    pub fn from_element(doc: &Element) -> ProtocolResult<Self> {
        let root = doc.expect_root("FolderSync")?;
        Ok(Self::new(SyncCursor::new(root.require_text("SyncKey")?)))
    }
}

/// Hierarchy sync response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderSyncResponse {
    /// Status code.
    pub status: u32,
    /// New hierarchy cursor.
    pub cursor: Option<SyncCursor>,
    /// Folder changes in document order.
    pub changes: Vec<ServerDelta>,
}

impl FolderSyncResponse {
    /// Creates a successful response.
    pub fn success(cursor: SyncCursor, changes: Vec<ServerDelta>) -> Self {
        Self {
            status: 1,
            cursor: Some(cursor),
            changes,
        }
    }

    /// Creates a failed response.
    pub fn error(status: u32) -> Self {
        Self {
            status,
            cursor: None,
            changes: Vec::new(),
        }
    }

    /// Builds the document.
    pub fn to_element(&self) -> Element {
        let mut root = Element::new("FolderSync")
            .with_namespace(FOLDER_HIERARCHY_NS)
            .with_leaf("Status", self.status.to_string());
        if let Some(cursor) = &self.cursor {
            root.push(Element::leaf("SyncKey", cursor.as_str()));
        }
        if !self.changes.is_empty() {
            let mut changes =
                Element::new("Changes").with_leaf("Count", self.changes.len().to_string());
            for delta in &self.changes {
                let name = match delta.kind {
                    DeltaKind::Add => "Add",
                    DeltaKind::Change => "Update",
                    DeltaKind::Delete => "Delete",
                };
                let mut el = Element::new(name).with_leaf("ServerId", &delta.server_id);
                if delta.kind != DeltaKind::Delete {
                    el.push(Element::leaf("ParentId", &delta.parent_id));
                    if let Some(name) = &delta.display_name {
                        el.push(Element::leaf("DisplayName", name));
                    }
                    if let Some(t) = delta.folder_type {
                        el.push(Element::leaf("Type", t.0.to_string()));
                    }
                }
                changes.push(el);
            }
            root.push(changes);
        }
        root
    }

    /// Parses the document.
    pub fn from_element(doc: &Element) -> ProtocolResult<Self> {
        let root = doc.expect_root("FolderSync")?;
        let status = root
            .parse_child::<u32>("Status")?
            .ok_or_else(|| ProtocolError::missing("FolderSync", "Status"))?;
        let cursor = root.child_text("SyncKey").map(SyncCursor::new);

        let mut changes = Vec::new();
        if let Some(list) = root.child("Changes") {
            for el in &list.children {
                let kind = match el.name.as_str() {
                    "Add" => DeltaKind::Add,
                    "Update" => DeltaKind::Change,
                    "Delete" => DeltaKind::Delete,
                    _ => continue,
                };
                let server_id = el.require_text("ServerId")?;
                let parent_id = match kind {
                    DeltaKind::Delete => el.child_text("ParentId").unwrap_or_default(),
                    _ => el.require_text("ParentId")?,
                };
                let folder_type = el.parse_child::<u32>("Type")?.map(FolderType);
                let display_name = el.child_text("DisplayName").map(str::to_string);
                changes.push(ServerDelta::folder(
                    kind,
                    server_id,
                    parent_id,
                    display_name,
                    folder_type,
                ));
            }
        }

        Ok(Self {
            status,
            cursor,
            changes,
        })
    }
}

/// Per-collection filter options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionOptions {
    /// Age filter code (5 = one month).
    pub filter_type: Option<u32>,
    /// Preferred body type (1 = plain text).
    pub body_preference: Option<u32>,
    /// Truncation size for the preferred body.
    pub truncation_size: Option<u32>,
    /// MIME support level for mail.
    pub mime_support: Option<u32>,
}

impl CollectionOptions {
    fn to_element(&self) -> Element {
        let mut options = Element::new("Options");
        if let Some(filter) = self.filter_type {
            options.push(Element::leaf("FilterType", filter.to_string()));
        }
        if let Some(mime) = self.mime_support {
            options.push(Element::leaf("MIMESupport", mime.to_string()));
        }
        if let Some(body) = self.body_preference {
            let mut pref = Element::new("BodyPreference").with_leaf("Type", body.to_string());
            if let Some(size) = self.truncation_size {
                pref.push(Element::leaf("TruncationSize", size.to_string()));
            }
            options.push(pref);
        }
        options
    }

    fn from_element(el: &Element) -> ProtocolResult<Self> {
        let pref = el.child("BodyPreference");
        Ok(Self {
            filter_type: el.parse_child("FilterType")?,
            mime_support: el.parse_child("MIMESupport")?,
            body_preference: match pref {
                Some(p) => p.parse_child("Type")?,
                None => None,
            },
            truncation_size: match pref {
                Some(p) => p.parse_child("TruncationSize")?,
                None => None,
            },
        })
    }
}

/// A local change pushed inside a Sync request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// Create with a client id.
    Add {
        /// Client temporary id.
        client_id: String,
        /// Item fields.
        fields: Fields,
    },
    /// Change an existing item.
    Change {
        /// Server id.
        server_id: String,
        /// Changed fields.
        fields: Fields,
    },
    /// Delete an existing item.
    Delete {
        /// Server id.
        server_id: String,
    },
}

impl ClientCommand {
    fn to_element(&self) -> Element {
        match self {
            ClientCommand::Add { client_id, fields } => Element::new("Add")
                .with_leaf("ClientId", client_id)
                .with_child(fields_to_element("ApplicationData", fields)),
            ClientCommand::Change { server_id, fields } => Element::new("Change")
                .with_leaf("ServerId", server_id)
                .with_child(fields_to_element("ApplicationData", fields)),
            ClientCommand::Delete { server_id } => {
                Element::new("Delete").with_leaf("ServerId", server_id)
            }
        }
    }

    fn from_element(el: &Element) -> ProtocolResult<Option<Self>> {
        let data = || {
            el.child("ApplicationData")
                .map(fields_from_element)
                .unwrap_or_default()
        };
        Ok(match el.name.as_str() {
            "Add" => Some(ClientCommand::Add {
                client_id: el.require_text("ClientId")?.to_string(),
                fields: data(),
            }),
            "Change" => Some(ClientCommand::Change {
                server_id: el.require_text("ServerId")?.to_string(),
                fields: data(),
            }),
            "Delete" => Some(ClientCommand::Delete {
                server_id: el.require_text("ServerId")?.to_string(),
            }),
            _ => None,
        })
    }
}

/// One collection in a Sync request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionRequest {
    /// Folder server id.
    pub collection_id: String,
    /// Folder cursor.
    pub cursor: SyncCursor,
    /// Ask for server changes.
    pub get_changes: bool,
    /// Max changes returned for this collection.
    pub window_size: Option<u32>,
    /// Filter options.
    pub options: Option<CollectionOptions>,
    /// Local changes to push.
    pub commands: Vec<ClientCommand>,
}

impl CollectionRequest {
    /// Creates a collection request with no options or commands.
    pub fn new(collection_id: impl Into<String>, cursor: SyncCursor) -> Self {
        Self {
            collection_id: collection_id.into(),
            cursor,
            get_changes: false,
            window_size: None,
            options: None,
            commands: Vec::new(),
        }
    }

    fn to_element(&self) -> Element {
        let mut el = Element::new("Collection")
            .with_leaf("SyncKey", self.cursor.as_str())
            .with_leaf("CollectionId", &self.collection_id);
        if self.get_changes {
            el.push(Element::new("GetChanges"));
        }
        if let Some(size) = self.window_size {
            el.push(Element::leaf("WindowSize", size.to_string()));
        }
        if let Some(options) = &self.options {
            el.push(options.to_element());
        }
        if !self.commands.is_empty() {
            let mut commands = Element::new("Commands");
            for cmd in &self.commands {
                commands.push(cmd.to_element());
            }
            el.push(commands);
        }
        el
    }

    fn from_element(el: &Element) -> ProtocolResult<Self> {
        let mut commands = Vec::new();
        if let Some(list) = el.child("Commands") {
            for c in &list.children {
                if let Some(cmd) = ClientCommand::from_element(c)? {
                    commands.push(cmd);
                }
            }
        }
        Ok(Self {
            collection_id: el.require_text("CollectionId")?.to_string(),
            cursor: SyncCursor::new(el.require_text("SyncKey")?),
            get_changes: el.child("GetChanges").is_some(),
            window_size: el.parse_child("WindowSize")?,
            options: el.child("Options").map(CollectionOptions::from_element).transpose()?,
            commands,
        })
    }
}

/// Sync request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncRequest {
    /// Collections to sync.
    pub collections: Vec<CollectionRequest>,
    /// Overall window size.
    pub window_size: Option<u32>,
}

impl SyncRequest {
    /// Builds the document.
    pub fn to_element(&self) -> Element {
        let mut collections = Element::new("Collections");
        for c in &self.collections {
            collections.push(c.to_element());
        }
        let mut root = Element::new("Sync")
            .with_namespace(AIRSYNC_NS)
            .with_child(collections);
        if let Some(size) = self.window_size {
            root.push(Element::leaf("WindowSize", size.to_string()));
        }
        root
    }

    /// Parses the document.
    pub fn from_element(doc: &Element) -> ProtocolResult<Self> {
        let root = doc.expect_root("Sync")?;
        let collections = root
            .require("Collections")?
            .children_named("Collection")
            .map(CollectionRequest::from_element)
            .collect::<ProtocolResult<Vec<_>>>()?;
        Ok(Self {
            collections,
            window_size: root.parse_child("WindowSize")?,
        })
    }
}

/// Server's answer to one pushed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientResponse {
    /// Which command this answers.
    pub kind: DeltaKind,
    /// Client id (for adds).
    pub client_id: Option<String>,
    /// Server id assigned or addressed.
    pub server_id: Option<String>,
    /// Status code.
    pub status: u32,
}

/// One collection in a Sync response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionResponse {
    /// Folder server id.
    pub collection_id: String,
    /// Class tag, when the server sends one.
    pub class: Option<EntityClass>,
    /// New cursor.
    pub cursor: Option<SyncCursor>,
    /// Collection status.
    pub status: u32,
    /// More changes are waiting on the server.
    pub more_available: bool,
    /// Server changes.
    pub commands: Vec<ServerDelta>,
    /// Answers to pushed client commands.
    pub responses: Vec<ClientResponse>,
}

impl CollectionResponse {
    /// Creates a successful collection response.
    pub fn success(collection_id: impl Into<String>, cursor: SyncCursor) -> Self {
        Self {
            collection_id: collection_id.into(),
            class: None,
            cursor: Some(cursor),
            status: 1,
            more_available: false,
            commands: Vec::new(),
            responses: Vec::new(),
        }
    }

    fn to_element(&self) -> Element {
        let mut el = Element::new("Collection");
        if let Some(class) = self.class {
            el.push(Element::leaf("Class", class.class_code()));
        }
        if let Some(cursor) = &self.cursor {
            el.push(Element::leaf("SyncKey", cursor.as_str()));
        }
        el.push(Element::leaf("CollectionId", &self.collection_id));
        el.push(Element::leaf("Status", self.status.to_string()));
        if self.more_available {
            el.push(Element::new("MoreAvailable"));
        }
        if !self.commands.is_empty() {
            let mut commands = Element::new("Commands");
            for delta in &self.commands {
                let name = match delta.kind {
                    DeltaKind::Add => "Add",
                    DeltaKind::Change => "Change",
                    DeltaKind::Delete => "Delete",
                };
                let mut cmd = Element::new(name).with_leaf("ServerId", &delta.server_id);
                if delta.kind != DeltaKind::Delete {
                    cmd.push(fields_to_element("ApplicationData", &delta.fields));
                }
                commands.push(cmd);
            }
            el.push(commands);
        }
        if !self.responses.is_empty() {
            let mut responses = Element::new("Responses");
            for r in &self.responses {
                let name = match r.kind {
                    DeltaKind::Add => "Add",
                    DeltaKind::Change => "Change",
                    DeltaKind::Delete => "Delete",
                };
                let mut resp = Element::new(name);
                if let Some(client_id) = &r.client_id {
                    resp.push(Element::leaf("ClientId", client_id));
                }
                if let Some(server_id) = &r.server_id {
                    resp.push(Element::leaf("ServerId", server_id));
                }
                resp.push(Element::leaf("Status", r.status.to_string()));
                responses.push(resp);
            }
            el.push(responses);
        }
        el
    }

    fn from_element(
        el: &Element,
        class_of: &dyn Fn(&str) -> Option<EntityClass>,
    ) -> ProtocolResult<Self> {
        let collection_id = el.require_text("CollectionId")?.to_string();
        let tagged = match el.child_text("Class") {
            Some(code) => Some(
                EntityClass::from_class_code(code)
                    .ok_or_else(|| ProtocolError::invalid("Class", code))?,
            ),
            None => None,
        };
        // Status is optional when every collection succeeded.
        let status = el.parse_child::<u32>("Status")?.unwrap_or(1);

        let mut commands = Vec::new();
        if let Some(list) = el.child("Commands") {
            let class = tagged
                .or_else(|| class_of(&collection_id))
                .ok_or_else(|| ProtocolError::invalid("CollectionId", collection_id.clone()))?;
            for c in &list.children {
                let kind = match c.name.as_str() {
                    "Add" => DeltaKind::Add,
                    "Change" => DeltaKind::Change,
                    "Delete" | "SoftDelete" => DeltaKind::Delete,
                    _ => continue,
                };
                let fields = c
                    .child("ApplicationData")
                    .map(fields_from_element)
                    .unwrap_or_default();
                commands.push(ServerDelta::item(
                    kind,
                    class,
                    c.require_text("ServerId")?,
                    collection_id.clone(),
                    fields,
                ));
            }
        }

        let mut responses = Vec::new();
        if let Some(list) = el.child("Responses") {
            for r in &list.children {
                let kind = match r.name.as_str() {
                    "Add" => DeltaKind::Add,
                    "Change" => DeltaKind::Change,
                    "Delete" => DeltaKind::Delete,
                    _ => continue,
                };
                responses.push(ClientResponse {
                    kind,
                    client_id: r.child_text("ClientId").map(str::to_string),
                    server_id: r.child_text("ServerId").map(str::to_string),
                    status: r.parse_child::<u32>("Status")?.unwrap_or(1),
                });
            }
        }

        Ok(Self {
            collection_id,
            class: tagged,
            cursor: el.child_text("SyncKey").map(SyncCursor::new),
            status,
            more_available: el.child("MoreAvailable").is_some(),
            commands,
            responses,
        })
    }
}

/// Sync response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncResponse {
    /// Top-level status; absent on success.
    pub status: Option<u32>,
    /// Per-collection results.
    pub collections: Vec<CollectionResponse>,
}

impl SyncResponse {
    /// Builds the document.
    pub fn to_element(&self) -> Element {
        let mut root = Element::new("Sync").with_namespace(AIRSYNC_NS);
        if let Some(status) = self.status {
            root.push(Element::leaf("Status", status.to_string()));
        }
        if !self.collections.is_empty() {
            let mut collections = Element::new("Collections");
            for c in &self.collections {
                collections.push(c.to_element());
            }
            root.push(collections);
        }
        root
    }

    /// Parses the document. `class_of` supplies the entity class for
    /// collections that carry no class tag.
    pub fn from_element(
        doc: &Element,
        class_of: &dyn Fn(&str) -> Option<EntityClass>,
    ) -> ProtocolResult<Self> {
        let root = doc.expect_root("Sync")?;
        let collections = match root.child("Collections") {
            Some(list) => list
                .children_named("Collection")
                .map(|c| CollectionResponse::from_element(c, class_of))
                .collect::<ProtocolResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(Self {
            status: root.parse_child("Status")?,
            collections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentCodec, XmlCodec};

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn field_flattening_roundtrip() {
        let f = fields(&[
            ("Subject", "Lunch"),
            ("Body.Type", "1"),
            ("Body.Data", "see you"),
            ("Read", "0"),
        ]);
        let el = fields_to_element("ApplicationData", &f);
        assert_eq!(el.require("Body").unwrap().child_text("Data"), Some("see you"));
        assert_eq!(fields_from_element(&el), f);
    }

    #[test]
    fn folder_sync_request_shape() {
        let doc = FolderSyncRequest::new(SyncCursor::initial()).to_element();
        assert_eq!(doc.namespace.as_deref(), Some(FOLDER_HIERARCHY_NS));
        assert_eq!(doc.child_text("SyncKey"), Some("0"));
    }

    #[test]
    fn folder_sync_response_parses_changes() {
        let response = FolderSyncResponse::success(
            SyncCursor::new("1"),
            vec![
                ServerDelta::folder(DeltaKind::Add, "5", "0", Some("Inbox".into()), Some(FolderType::INBOX)),
                ServerDelta::folder(DeltaKind::Change, "6", "5", Some("Renamed".into()), Some(FolderType::USER_MAIL)),
                ServerDelta::folder(DeltaKind::Delete, "7", "", None, None),
            ],
        );
        let bytes = XmlCodec.encode(&response.to_element()).unwrap();
        let parsed = FolderSyncResponse::from_element(&XmlCodec.decode(&bytes).unwrap()).unwrap();
        assert_eq!(parsed, response);
    }

    #[test]
    fn folder_sync_error_has_no_cursor() {
        let parsed = FolderSyncResponse::from_element(&FolderSyncResponse::error(9).to_element()).unwrap();
        assert_eq!(parsed.status, 9);
        assert!(parsed.cursor.is_none());
        assert!(parsed.changes.is_empty());
    }

    #[test]
    fn folder_sync_add_requires_parent() {
        let doc = Element::new("FolderSync")
            .with_leaf("Status", "1")
            .with_child(Element::new("Changes").with_child(Element::new("Add").with_leaf("ServerId", "3")));
        assert!(FolderSyncResponse::from_element(&doc).is_err());
    }

    #[test]
    fn sync_request_carries_commands_and_options() {
        let mut collection = CollectionRequest::new("5", SyncCursor::new("abc"));
        collection.get_changes = true;
        collection.window_size = Some(25);
        collection.options = Some(CollectionOptions {
            filter_type: Some(5),
            body_preference: Some(1),
            truncation_size: Some(4096),
            mime_support: None,
        });
        collection.commands = vec![
            ClientCommand::Delete { server_id: "5:1".into() },
            ClientCommand::Add { client_id: "c1".into(), fields: fields(&[("Subject", "x")]) },
        ];
        let request = SyncRequest { collections: vec![collection], window_size: Some(25) };
        let doc = request.to_element();
        let c = doc.require("Collections").unwrap().require("Collection").unwrap();
        assert!(c.child("GetChanges").is_some());
        assert_eq!(c.require("Commands").unwrap().children.len(), 2);
        assert_eq!(SyncRequest::from_element(&doc).unwrap(), request);
    }

    #[test]
    fn sync_response_uses_class_lookup() {
        let mut collection = CollectionResponse::success("cal", SyncCursor::new("2"));
        collection.commands.push(ServerDelta::item(
            DeltaKind::Add,
            EntityClass::Calendar,
            "cal:1",
            "cal",
            fields(&[("Subject", "Standup")]),
        ));
        collection.responses.push(ClientResponse {
            kind: DeltaKind::Add,
            client_id: Some("tmp".into()),
            server_id: Some("cal:2".into()),
            status: 1,
        });
        let response = SyncResponse { status: None, collections: vec![collection] };
        let parsed =
            SyncResponse::from_element(&response.to_element(), &|_| Some(EntityClass::Calendar)).unwrap();
        assert_eq!(parsed, response);

        let err = SyncResponse::from_element(&response.to_element(), &|_| None).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidValue { .. }));
    }

    #[test]
    fn sync_response_class_tag_wins() {
        let doc = Element::new("Sync").with_child(
            Element::new("Collections").with_child(
                Element::new("Collection")
                    .with_leaf("Class", "Tasks")
                    .with_leaf("SyncKey", "3")
                    .with_leaf("CollectionId", "t")
                    .with_child(
                        Element::new("Commands")
                            .with_child(Element::new("SoftDelete").with_leaf("ServerId", "t:1")),
                    ),
            ),
        );
        let parsed = SyncResponse::from_element(&doc, &|_| Some(EntityClass::Email)).unwrap();
        let delta = &parsed.collections[0].commands[0];
        assert_eq!(delta.class, EntityClass::Task);
        assert_eq!(delta.kind, DeltaKind::Delete);
        assert_eq!(parsed.collections[0].status, 1);
    }

    #[test]
    fn sync_response_top_level_status_only() {
        let doc = Element::new("Sync").with_leaf("Status", "12");
        let parsed = SyncResponse::from_element(&doc, &|_| None).unwrap();
        assert_eq!(parsed.status, Some(12));
        assert!(parsed.collections.is_empty());
    }
}

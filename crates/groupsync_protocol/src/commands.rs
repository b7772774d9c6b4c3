//! Documents for single-row backlog commands: hierarchy edits, moves and
//! outgoing mail.

use crate::cursor::SyncCursor;
use crate::document::Element;
use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::FOLDER_HIERARCHY_NS;
use crate::model::FolderType;

/// Namespace of MoveItems documents.
pub const MOVE_NS: &str = "Move";
/// Namespace of outgoing-mail documents.
pub const COMPOSE_MAIL_NS: &str = "ComposeMail";

/// Hierarchy edit request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderCommandRequest {
    /// Create a folder.
    Create {
        /// Hierarchy cursor.
        cursor: SyncCursor,
        /// Parent server id.
        parent_id: String,
        /// Display name.
        display_name: String,
        /// Type code.
        folder_type: FolderType,
    },
    /// Rename and/or move a folder.
    Update {
        /// Hierarchy cursor.
        cursor: SyncCursor,
        /// Folder server id.
        server_id: String,
        /// New parent server id.
        parent_id: String,
        /// New display name.
        display_name: String,
    },
    /// Delete a folder.
    Delete {
        /// Hierarchy cursor.
        cursor: SyncCursor,
        /// Folder server id.
        server_id: String,
    },
}

impl FolderCommandRequest {
    /// Root element name of the request and its response.
    pub fn root_name(&self) -> &'static str {
        match self {
            FolderCommandRequest::Create { .. } => "FolderCreate",
            FolderCommandRequest::Update { .. } => "FolderUpdate",
            FolderCommandRequest::Delete { .. } => "FolderDelete",
        }
    }

    /// Builds the document.
    pub fn to_element(&self) -> Element {
        let root = Element::new(self.root_name()).with_namespace(FOLDER_HIERARCHY_NS);
        match self {
            FolderCommandRequest::Create {
                cursor,
                parent_id,
                display_name,
                folder_type,
            } => root
                .with_leaf("SyncKey", cursor.as_str())
                .with_leaf("ParentId", parent_id)
                .with_leaf("DisplayName", display_name)
                .with_leaf("Type", folder_type.0.to_string()),
            FolderCommandRequest::Update {
                cursor,
                server_id,
                parent_id,
                display_name,
            } => root
                .with_leaf("SyncKey", cursor.as_str())
                .with_leaf("ServerId", server_id)
                .with_leaf("ParentId", parent_id)
                .with_leaf("DisplayName", display_name),
            FolderCommandRequest::Delete { cursor, server_id } => root
                .with_leaf("SyncKey", cursor.as_str())
                .with_leaf("ServerId", server_id),
        }
    }
}

/// Response to any hierarchy edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderCommandResponse {
    /// Status code.
    pub status: u32,
    /// New hierarchy cursor.
    pub cursor: Option<SyncCursor>,
    /// Server id of a created folder.
    pub server_id: Option<String>,
}

impl FolderCommandResponse {
    /// Builds the document under `root`.
    pub fn to_element(&self, root: &str) -> Element {
        let mut el = Element::new(root)
            .with_namespace(FOLDER_HIERARCHY_NS)
            .with_leaf("Status", self.status.to_string());
        if let Some(cursor) = &self.cursor {
            el.push(Element::leaf("SyncKey", cursor.as_str()));
        }
        if let Some(id) = &self.server_id {
            el.push(Element::leaf("ServerId", id));
        }
        el
    }

    /// Parses the document, which must be rooted at `root`.
    pub fn from_element(doc: &Element, root: &str) -> ProtocolResult<Self> {
        let el = doc.expect_root(root)?;
        Ok(Self {
            status: el
                .parse_child::<u32>("Status")?
                .ok_or_else(|| ProtocolError::missing(root, "Status"))?,
            cursor: el.child_text("SyncKey").map(SyncCursor::new),
            server_id: el.child_text("ServerId").map(str::to_string),
        })
    }
}

/// MoveItems request for a single item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveItemsRequest {
    /// Item server id.
    pub src_msg_id: String,
    /// Source folder server id.
    pub src_fld_id: String,
    /// Destination folder server id.
    pub dst_fld_id: String,
}

impl MoveItemsRequest {
    /// Builds the document.
    pub fn to_element(&self) -> Element {
        Element::new("MoveItems").with_namespace(MOVE_NS).with_child(
            Element::new("Move")
                .with_leaf("SrcMsgId", &self.src_msg_id)
                .with_leaf("SrcFldId", &self.src_fld_id)
                .with_leaf("DstFldId", &self.dst_fld_id),
        )
    }
}

/// MoveItems response for a single item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveItemsResponse {
    /// Status code.
    pub status: u32,
    /// Item id before the move.
    pub src_msg_id: Option<String>,
    /// Item id after the move, if the server reassigned it.
    pub dst_msg_id: Option<String>,
}

impl MoveItemsResponse {
    /// Builds the document.
    pub fn to_element(&self) -> Element {
        let mut response = Element::new("Response");
        if let Some(src) = &self.src_msg_id {
            response.push(Element::leaf("SrcMsgId", src));
        }
        response.push(Element::leaf("Status", self.status.to_string()));
        if let Some(dst) = &self.dst_msg_id {
            response.push(Element::leaf("DstMsgId", dst));
        }
        Element::new("MoveItems")
            .with_namespace(MOVE_NS)
            .with_child(response)
    }

    /// Parses the document.
    pub fn from_element(doc: &Element) -> ProtocolResult<Self> {
        let response = doc.expect_root("MoveItems")?.require("Response")?;
        Ok(Self {
            status: response
                .parse_child::<u32>("Status")?
                .ok_or_else(|| ProtocolError::missing("Response", "Status"))?,
            src_msg_id: response.child_text("SrcMsgId").map(str::to_string),
            dst_msg_id: response.child_text("DstMsgId").map(str::to_string),
        })
    }
}

/// How an outgoing message relates to an existing one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingKind {
    /// New message.
    Send,
    /// Reply to `item_id` in `folder_id`.
    Reply {
        /// Folder server id.
        folder_id: String,
        /// Item server id.
        item_id: String,
    },
    /// Forward of `item_id` in `folder_id`.
    Forward {
        /// Folder server id.
        folder_id: String,
        /// Item server id.
        item_id: String,
    },
}

/// SendMail, SmartReply or SmartForward request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMailRequest {
    /// Relation to an existing message.
    pub kind: OutgoingKind,
    /// Client id of the outgoing message.
    pub client_id: String,
    /// Keep a copy in sent items.
    pub save_in_sent: bool,
    /// RFC 822 message.
    pub mime: String,
}

impl SendMailRequest {
    /// Root element name.
    pub fn root_name(&self) -> &'static str {
        match self.kind {
            OutgoingKind::Send => "SendMail",
            OutgoingKind::Reply { .. } => "SmartReply",
            OutgoingKind::Forward { .. } => "SmartForward",
        }
    }

    /// Builds the document.
    pub fn to_element(&self) -> Element {
        let mut root = Element::new(self.root_name())
            .with_namespace(COMPOSE_MAIL_NS)
            .with_leaf("ClientId", &self.client_id);
        if self.save_in_sent {
            root.push(Element::new("SaveInSentItems"));
        }
        match &self.kind {
            OutgoingKind::Send => {}
            OutgoingKind::Reply { folder_id, item_id }
            | OutgoingKind::Forward { folder_id, item_id } => root.push(
                Element::new("Source")
                    .with_leaf("FolderId", folder_id)
                    .with_leaf("ItemId", item_id),
            ),
        }
        root.with_leaf("Mime", &self.mime)
    }
}

/// Status carried by a non-empty outgoing-mail response. Success is an
/// empty body.
pub fn send_mail_status(doc: &Element) -> ProtocolResult<Option<u32>> {
    doc.parse_child("Status")
}

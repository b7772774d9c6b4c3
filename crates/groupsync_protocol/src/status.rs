//! Application-level status codes carried inside response documents.
//!
//! Every table maps a numeric code onto a [`StatusDisposition`], which is all
//! the engine needs to decide what happens next.

/// What a status code asks the client to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusDisposition {
    /// Carry on processing the response.
    Proceed,
    /// Issue the same request again right away; cursors are left alone.
    RetryNow,
    /// The server wants the folder hierarchy re-derived from scratch.
    Resync,
    /// Give up on this round trip.
    HardFail,
}

/// Top-level and per-collection status of a Sync response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStatus {
    /// Success.
    Success,
    /// The presented sync key is unknown to the server.
    SyncKeyInvalid,
    /// Malformed request.
    ProtocolError,
    /// Generic server failure.
    ServerError,
    /// Client-supplied data could not be converted.
    ClientError,
    /// Conflict resolved in the server's favour.
    ServerWins,
    /// The object or collection does not exist.
    NotFound,
    /// Mailbox is full.
    NoSpace,
    /// The folder hierarchy changed under the request.
    FolderChange,
    /// The server wants the full request resent.
    ResendFull,
    /// Wait or heartbeat interval out of range.
    LimitReWait,
    /// Too many collections in one request.
    TooMany,
    /// Transient server condition; retry.
    Retry,
}

impl SyncStatus {
    /// Converts from the wire code.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Success),
            3 => Some(Self::SyncKeyInvalid),
            4 => Some(Self::ProtocolError),
            5 => Some(Self::ServerError),
            6 => Some(Self::ClientError),
            7 => Some(Self::ServerWins),
            8 => Some(Self::NotFound),
            9 => Some(Self::NoSpace),
            12 => Some(Self::FolderChange),
            13 => Some(Self::ResendFull),
            14 => Some(Self::LimitReWait),
            15 => Some(Self::TooMany),
            16 => Some(Self::Retry),
            _ => None,
        }
    }

    /// Converts to the wire code.
    pub fn to_code(self) -> u32 {
        match self {
            Self::Success => 1,
            Self::SyncKeyInvalid => 3,
            Self::ProtocolError => 4,
            Self::ServerError => 5,
            Self::ClientError => 6,
            Self::ServerWins => 7,
            Self::NotFound => 8,
            Self::NoSpace => 9,
            Self::FolderChange => 12,
            Self::ResendFull => 13,
            Self::LimitReWait => 14,
            Self::TooMany => 15,
            Self::Retry => 16,
        }
    }

    /// Disposition of a status found at the top of a Sync response.
    pub fn top_level_disposition(code: u32) -> StatusDisposition {
        match Self::from_code(code) {
            Some(Self::Success) => StatusDisposition::Proceed,
            Some(Self::Retry | Self::ResendFull | Self::LimitReWait) => StatusDisposition::RetryNow,
            Some(Self::SyncKeyInvalid | Self::FolderChange) => StatusDisposition::Resync,
            _ => StatusDisposition::HardFail,
        }
    }
}

/// Status of a FolderSync response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FolderSyncStatus {
    /// Success.
    Success,
    /// Transient server condition.
    Retry,
    /// The hierarchy sync key is invalid; start over.
    ReSync,
    /// Malformed request.
    BadFormat,
    /// The server could not say what went wrong.
    Unknown,
    /// Server failure.
    ServerFail,
}

impl FolderSyncStatus {
    /// Converts from the wire code.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Success),
            6 => Some(Self::Retry),
            9 => Some(Self::ReSync),
            10 => Some(Self::BadFormat),
            11 => Some(Self::Unknown),
            12 => Some(Self::ServerFail),
            _ => None,
        }
    }

    /// Converts to the wire code.
    pub fn to_code(self) -> u32 {
        match self {
            Self::Success => 1,
            Self::Retry => 6,
            Self::ReSync => 9,
            Self::BadFormat => 10,
            Self::Unknown => 11,
            Self::ServerFail => 12,
        }
    }

    /// Disposition of a FolderSync status code.
    pub fn disposition(code: u32) -> StatusDisposition {
        match Self::from_code(code) {
            Some(Self::Success) => StatusDisposition::Proceed,
            Some(Self::Retry | Self::Unknown) => StatusDisposition::RetryNow,
            Some(Self::ReSync) => StatusDisposition::Resync,
            Some(Self::BadFormat | Self::ServerFail) | None => StatusDisposition::HardFail,
        }
    }
}

/// Status shared by FolderCreate, FolderUpdate and FolderDelete responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FolderCommandStatus {
    /// Success.
    Success,
    /// A folder with that name already exists.
    Exists,
    /// The target is a special folder.
    Special,
    /// The target folder does not exist.
    Missing,
    /// The parent folder does not exist.
    BadParent,
    /// Server failure.
    ServerError,
    /// The hierarchy sync key is invalid.
    ReSync,
    /// Malformed request.
    BadFormat,
    /// Unknown failure.
    Unknown,
    /// Back-end failure.
    BackEndError,
}

impl FolderCommandStatus {
    /// Converts from the wire code.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Success),
            2 => Some(Self::Exists),
            3 => Some(Self::Special),
            4 => Some(Self::Missing),
            5 => Some(Self::BadParent),
            6 => Some(Self::ServerError),
            9 => Some(Self::ReSync),
            10 => Some(Self::BadFormat),
            11 => Some(Self::Unknown),
            12 => Some(Self::BackEndError),
            _ => None,
        }
    }

    /// Disposition for the round trip as a whole. Per-row failures are
    /// `Proceed`: the row is resolved as failed and the session continues.
    pub fn disposition(code: u32) -> StatusDisposition {
        match Self::from_code(code) {
            Some(Self::ReSync) => StatusDisposition::Resync,
            Some(Self::BadFormat) => StatusDisposition::HardFail,
            _ => StatusDisposition::Proceed,
        }
    }
}

/// Status of a MoveItems response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MoveStatus {
    /// The source item is gone.
    InvalidSource,
    /// The destination folder is gone.
    InvalidDestination,
    /// Success.
    Success,
    /// Source and destination are the same folder.
    SameFolder,
    /// Multiple destinations or a lock.
    ClobberOrMulti,
    /// Source or destination locked.
    Locked,
}

impl MoveStatus {
    /// Converts from the wire code.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::InvalidSource),
            2 => Some(Self::InvalidDestination),
            3 => Some(Self::Success),
            4 => Some(Self::SameFolder),
            5 => Some(Self::ClobberOrMulti),
            7 => Some(Self::Locked),
            _ => None,
        }
    }

    /// Returns true if the item ended up where the client wanted it.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::SameFolder)
    }
}

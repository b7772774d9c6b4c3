//! The seam between the transport machine and protocol commands.

use crate::error::SyncResult;
use groupsync_protocol::{Element, StatusDisposition};
use std::fmt;

/// How a round trip ended, as reported to the owner of the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Done; nothing more to do for this command.
    Success,
    /// Done, but the same kind of command should run again right away.
    SyncAgain,
    /// The folder hierarchy must be re-derived.
    Resync(String),
    /// The round trip failed permanently.
    HardFail(String),
    /// Credentials were rejected.
    AuthFail(String),
    /// The device policy flow is required.
    ReProvision,
    /// The endpoint must be rediscovered.
    Rediscover(String),
    /// The server mailbox is out of space.
    OutOfSpace,
}

impl Outcome {
    /// Maps an application status disposition. `Proceed` maps to `None`:
    /// the caller carries on parsing.
    pub fn from_disposition(disposition: StatusDisposition, what: &str, code: u32) -> Option<Self> {
        match disposition {
            StatusDisposition::Proceed => None,
            StatusDisposition::RetryNow => Some(Outcome::SyncAgain),
            StatusDisposition::Resync => Some(Outcome::Resync(format!("{what} status {code}"))),
            StatusDisposition::HardFail => Some(Outcome::HardFail(format!("{what} status {code}"))),
        }
    }

    /// Returns true for outcomes that need the user before anything else
    /// can happen.
    pub fn needs_user(&self) -> bool {
        matches!(
            self,
            Outcome::AuthFail(_) | Outcome::ReProvision | Outcome::Rediscover(_)
        )
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::SyncAgain => write!(f, "sync again"),
            Outcome::Resync(why) => write!(f, "resync ({why})"),
            Outcome::HardFail(why) => write!(f, "hard failure ({why})"),
            Outcome::AuthFail(why) => write!(f, "authentication failure ({why})"),
            Outcome::ReProvision => write!(f, "re-provision"),
            Outcome::Rediscover(why) => write!(f, "rediscover ({why})"),
            Outcome::OutOfSpace => write!(f, "server out of space"),
        }
    }
}

/// A protocol command driven by the transport machine.
///
/// The request is built once per command and resent unchanged on retry.
/// Everything a command does to the store happens inside its own
/// transactions.
pub trait Command: Send {
    /// Protocol command name, sent as the `Cmd` query parameter.
    fn name(&self) -> &'static str;

    /// Builds the request document. `None` sends an empty body.
    fn build_request(&mut self) -> SyncResult<Option<Element>>;

    /// Offered the top-level `Status` of a 2xx document first. Returning an
    /// outcome ends the round trip without [`process_response`](Self::process_response).
    fn process_top_level_status(&mut self, _status: u32) -> Option<Outcome> {
        None
    }

    /// Processes a 2xx response. `None` means the body was empty. An error
    /// is a hard failure.
    fn process_response(&mut self, doc: Option<&Element>) -> SyncResult<Outcome>;

    /// Called when the round trip ends without a processed response, so
    /// rows marked as dispatched can be put back in the queue.
    fn on_abandon(&mut self) {}
}

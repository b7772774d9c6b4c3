//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding, decoding or interpreting wire documents.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The byte stream could not be turned into a document (or back).
    #[error("codec error: {0}")]
    Codec(String),

    /// A required element was absent.
    #[error("missing element <{element}> in <{parent}>")]
    MissingElement {
        /// Enclosing element name.
        parent: String,
        /// Name of the element that was expected.
        element: String,
    },

    /// An element carried a value that could not be interpreted.
    #[error("invalid value for <{element}>: {value:?}")]
    InvalidValue {
        /// Element name.
        element: String,
        /// Offending text.
        value: String,
    },

    /// The document root was not the one the command expects.
    #[error("unexpected root <{found}>, expected <{expected}>")]
    UnexpectedRoot {
        /// Expected root element.
        expected: String,
        /// Root element actually found.
        found: String,
    },
}

impl ProtocolError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec(message.into())
    }

    /// Creates a missing-element error.
    pub fn missing(parent: impl Into<String>, element: impl Into<String>) -> Self {
        Self::MissingElement {
            parent: parent.into(),
            element: element.into(),
        }
    }

    /// Creates an invalid-value error.
    pub fn invalid(element: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidValue {
            element: element.into(),
            value: value.into(),
        }
    }

    /// Returns true if the error arose in the byte codec rather than in
    /// the interpretation of a well-formed document.
    pub fn is_codec(&self) -> bool {
        matches!(self, ProtocolError::Codec(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::missing("Collection", "SyncKey");
        assert_eq!(err.to_string(), "missing element <SyncKey> in <Collection>");

        let err = ProtocolError::invalid("Status", "abc");
        assert!(err.to_string().contains("abc"));
    }

    #[test]
    fn codec_predicate() {
        assert!(ProtocolError::codec("truncated").is_codec());
        assert!(!ProtocolError::missing("a", "b").is_codec());
    }
}

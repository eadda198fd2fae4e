use crate::identity::ResourceIdentity;

/// Marker some transports put in front of the human readable part of a
/// longer status string.
const MESSAGE_MARKER: &str = "Message: ";

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The remote could not be reached or answered with a failure.
    #[error("{message}")]
    Transport {
        status: Option<u16>,
        message: String,
    },

    /// The remote confirmed the resource does not exist.
    #[error("{0} not found")]
    NotFound(ResourceIdentity),

    #[error("unsupported resource {identity}: {reason}")]
    UnsupportedResource {
        identity: ResourceIdentity,
        reason: String,
    },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid local resource: {0}")]
    InvalidLocalState(String),

    /// The resource is not part of the resource set.
    #[error("unknown resource {0}")]
    UnknownResource(ResourceIdentity),

    #[error("load config failed, {0}")]
    Config(String),
}

impl Error {
    pub fn transport(status: Option<u16>, message: impl AsRef<str>) -> Self {
        Error::Transport {
            status,
            message: detail_message(message.as_ref()).to_string(),
        }
    }

    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Short title used when the error is shown as a reconciliation state.
    pub fn title(&self) -> &'static str {
        match self {
            Error::Transport { .. } => "Error contacting cluster",
            Error::NotFound(_) => "Resource not found",
            Error::UnsupportedResource { .. } => "Unsupported resource kind",
            Error::Unauthorized(_) => "Unauthorized",
            Error::InvalidLocalState(_) => "Invalid resource",
            Error::UnknownResource(_) => "Unknown resource",
            Error::Config(_) => "Invalid configuration",
        }
    }
}

/// The part of `message` after the `"Message: "` marker, or all of it.
pub fn detail_message(message: &str) -> &str {
    match message.find(MESSAGE_MARKER) {
        Some(pos) => message[pos + MESSAGE_MARKER.len()..].trim(),
        None => message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_detail() {
        assert_eq!(
            detail_message(
                "api server error, code: 409, reason: Conflict, Message: the object has been modified"
            ),
            "the object has been modified"
        );
        assert_eq!(detail_message("connection refused"), "connection refused");
        assert_eq!(detail_message("Message: "), "");
    }

    #[test]
    fn transport_keeps_detail_only() {
        let err = Error::transport(Some(422), "Failure executing: PUT. Message: field is immutable");

        assert_eq!(err.to_string(), "field is immutable");
        assert!(matches!(err, Error::Transport { status: Some(422), .. }));
    }
}

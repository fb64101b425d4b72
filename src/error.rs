use std::fmt::{self, Display};

use uuid::Uuid;

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug)]
pub enum ClientError {
    /// Error occurred during an IO operation.
    Io(std::io::Error),
    /// The row store or broadcast transport reported a failure.
    Backend(String),
    /// Input was rejected client-side before any network round-trip.
    Validation(String),
    /// The current user is not a member of the target channel's server.
    NotAMember,
    /// The referenced channel does not exist (or was deleted under us).
    ChannelNotFound(Uuid),
    /// Custom error
    Custom(String),
}

impl Clone for ClientError {
    fn clone(&self) -> Self {
        use ClientError::*;

        match self {
            Backend(err) => Backend(err.clone()),
            Validation(err) => Validation(err.clone()),
            NotAMember => NotAMember,
            ChannelNotFound(id) => ChannelNotFound(*id),
            Custom(err) => Custom(err.clone()),
            _ => Custom(self.to_string()),
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(other: std::io::Error) -> Self {
        Self::Io(other)
    }
}

impl Display for ClientError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClientError::Io(err) => write!(fmt, "An IO error occurred: {}", err),
            ClientError::Backend(err) => write!(fmt, "Backend error: {}", err),
            ClientError::Validation(err) => write!(fmt, "{}", err),
            ClientError::NotAMember => write!(fmt, "Not a member of this server."),
            ClientError::ChannelNotFound(id) => write!(fmt, "Channel not found: {}", id),
            ClientError::Custom(msg) => write!(fmt, "{}", msg),
        }
    }
}

use mcphub_common::FromMessage;

use crate::channel::Channel;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no subscriber on {channel}")]
    NoSubscribers { channel: Channel },
    #[error("malformed message on {channel}: {reason}")]
    Malformed { channel: Channel, reason: String },
    #[error("unknown channel '{0}'")]
    UnknownChannel(String),
    #[error("bus is closed")]
    Closed,
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[cfg(feature = "redis")]
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
    #[error("{message}")]
    Message { message: String },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    pub(crate) fn malformed(channel: Channel, reason: impl Into<String>) -> Self {
        Self::Malformed {
            channel,
            reason: reason.into(),
        }
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

mcphub_common::impl_context!();

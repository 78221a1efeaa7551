use std::path::PathBuf;

use mcphub_common::FromMessage;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },
    #[error("unsupported config format: .{ext}")]
    UnsupportedFormat { ext: String },
    #[error("invalid configuration:\n  {}", problems.join("\n  "))]
    Invalid { problems: Vec<String> },
    #[error("{message}")]
    Message { message: String },
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

mcphub_common::impl_context!();

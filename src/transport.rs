use chrono::{DateTime, FixedOffset};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

/// Failure taxonomy for message-store operations.
///
/// `Transient` failures may be repeated by the retry envelope; `Permanent`
/// and `Malformed` never are. `Malformed` marks a single message as
/// unusable so the caller can skip it without aborting the run.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transient transport failure: {0}")]
    Transient(String),
    #[error("permanent transport failure: {0}")]
    Permanent(String),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("giving up after {attempts} attempts, last error: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}

/// A message as fetched from the source account. Immutable once fetched.
#[derive(Debug, Clone)]
pub struct SourceMessage {
    /// 0-based position within the selected source folder.
    pub index: u32,
    pub body: Vec<u8>,
    pub flags: Vec<String>,
    pub internal_date: DateTime<FixedOffset>,
    /// Source-side labels. For folder-oriented stores this is the name of
    /// the folder the message was fetched from.
    pub labels: Vec<String>,
}

/// The opaque message-store capability. Implementations own connection
/// state; `reconnect` tears the connection down and builds a fresh one.
/// Folder selection does not survive a reconnect, the caller re-selects.
pub trait Transport {
    fn list_folders(&mut self) -> Result<Vec<String>>;

    /// Selects a folder and returns the number of messages in it.
    fn select_folder(&mut self, folder: &str) -> Result<u32>;

    /// Fetches the message at the given 0-based index of the selected folder.
    fn fetch_message(&mut self, index: u32) -> Result<SourceMessage>;

    fn create_folder(&mut self, folder: &str) -> Result<()>;

    fn append(
        &mut self,
        folder: &str,
        body: &[u8],
        flags: &[String],
        internal_date: DateTime<FixedOffset>,
    ) -> Result<()>;

    fn reconnect(&mut self) -> Result<()>;
}

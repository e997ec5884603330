use thiserror::Error;

/// An error that happens while reading from or writing to a sheet.
///
/// The error is `Clone` because a single failed fetch is handed out to every caller that was
/// waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The remote source responded, but the response carried no grid at all.
    #[error("no data")]
    NoData,
    /// The configured header row is missing from the fetched range or has no non-empty cell.
    #[error("header row empty")]
    HeaderEmpty,
    /// A header based operation was requested while `header_rows` is `0`.
    #[error("no header row configured")]
    NoHeaderRow,
    /// The append request did not produce a new row.
    ///
    /// Either the remote reported zero updated rows, or the input could not be turned into a
    /// row in the first place.
    #[error("append rejected: {0}")]
    AppendRejected(String),
    /// A synchronous read found nothing settled yet.
    #[error("no settled value")]
    NotSettled,
    /// The spreadsheet or range does not exist.
    #[error("not found")]
    NotFound,
    /// The remote refused access.
    ///
    /// The attached string contains the remote source's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The request failed due to connection loss, DNS resolution, or an unexpected server
    /// response.
    #[error("request failed: {0}")]
    Remote(String),
    /// The remote responded with something that could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),
    /// The computation ended without producing a result.
    #[error("computation interrupted")]
    Interrupted,
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Malformed(err.to_string())
        } else {
            Self::Remote(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

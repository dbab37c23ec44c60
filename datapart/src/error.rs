use snafu::prelude::*;
use std::path::PathBuf;
use url::Url;

pub type Result<T, E = UploadError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum UploadError {
    #[snafu(display("No backend API base URL is configured; set `api_base_url` in the config"))]
    MissingApiBaseUrl,

    #[snafu(display("Unable to build the URL for backend endpoint '{endpoint}' from base '{base}'"))]
    InvalidApiUrl {
        base: Url,
        endpoint: String,
        source: url::ParseError,
    },

    #[snafu(display("Error calling backend endpoint '{endpoint}'"))]
    ApiRequest {
        endpoint: String,
        source: reqwest::Error,
    },

    #[snafu(display("Backend endpoint '{endpoint}' returned HTTP status {status}: {body}"))]
    ApiHttpStatus {
        endpoint: String,
        status: reqwest::StatusCode,
        body: String,
    },

    #[snafu(display("Backend endpoint '{endpoint}' rejected the request with code {code}: {msg}"))]
    ApiRejected {
        endpoint: String,
        code: u32,
        msg: String,
    },

    #[snafu(display("Backend endpoint '{endpoint}' reported success but returned no data"))]
    ApiResponseMissingData { endpoint: String },

    #[snafu(display("The backend returned an invalid upload URL '{url}' for part {part_number}"))]
    InvalidPartUrl {
        part_number: u32,
        url: String,
        source: url::ParseError,
    },

    #[snafu(display("Error uploading a part to object storage host '{host}'"))]
    PartUpload { host: String, source: reqwest::Error },

    #[snafu(display("Object storage host '{host}' rejected a part upload with HTTP status {status}: {body}"))]
    PartUploadRejected {
        host: String,
        status: reqwest::StatusCode,
        body: String,
    },

    #[snafu(display("Object storage host '{host}' accepted a part but returned no ETag header"))]
    MissingEtag { host: String },

    #[snafu(display("Transfer of part {part_number} was aborted"))]
    PartTransferAborted { part_number: u32 },

    #[snafu(display("Error opening upload source file '{}'", path.display()))]
    OpenSource {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Error reading {len} bytes at offset {offset} from upload source '{name}'"))]
    ReadSource {
        name: String,
        offset: u64,
        len: u64,
        source: std::io::Error,
    },

    #[snafu(display("Byte range {start}..{end} is outside of upload source '{name}' which is {size} bytes"))]
    SourceRangeOutOfBounds {
        name: String,
        start: u64,
        end: u64,
        size: u64,
    },

    #[snafu(display("Error accessing upload session file '{}'", path.display()))]
    SessionIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Error serializing the upload session for object '{object_name}'"))]
    SessionSerialize {
        object_name: String,
        source: serde_json::Error,
    },

    #[snafu(display("No persisted upload session exists for object '{object_name}'"))]
    SessionNotFound { object_name: String },

    #[snafu(display("The upload job task for object '{object_name}' failed to run to completion"))]
    UploadTaskFailed {
        object_name: String,
        source: tokio::task::JoinError,
    },
}

impl UploadError {
    /// Whether this error means a part transfer was deliberately cancelled.
    ///
    /// Aborted transfers are a clean stop of the upload, not a failure, so the upload coordinator
    /// swallows errors in this class.
    pub fn is_abort(&self) -> bool {
        matches!(self, UploadError::PartTransferAborted { .. })
    }
}

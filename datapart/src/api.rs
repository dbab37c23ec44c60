//! Interfaces to the external services an upload depends on.
//!
//! The marketplace backend owns the multipart upload protocol: it initiates uploads, pre-signs a
//! URL for each part, and assembles or discards the parts.  The bytes themselves go straight to
//! object storage through the pre-signed URLs, which is what [`PartTransport`] abstracts.
//!
//! Both are traits so that the coordinator can be driven against an in-memory backend in tests,
//! or a backend other than the REST one in [`crate::http`].
use crate::Result;
use bytes::Bytes;
use dyn_clone::DynClone;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use url::Url;

/// Reply to initiating a multipart upload
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadResponse {
    pub upload_id: String,

    /// The backend may store the object under a different name than was requested
    #[serde(default)]
    pub object_name: Option<String>,
}

/// One entry in the part list submitted when completing an upload
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CompletedPart {
    #[serde(rename = "ETag")]
    pub etag: String,

    #[serde(rename = "PartNumber")]
    pub part_number: u32,
}

/// Reply to completing a multipart upload
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadResponse {
    /// Name of the assembled object, if the backend reports it
    #[serde(default)]
    pub object_name: Option<String>,

    #[serde(default)]
    pub message: String,
}

/// Reply to aborting a multipart upload
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct AbortUploadResponse {
    #[serde(default)]
    pub message: String,
}

/// The backend half of the multipart upload protocol, plus the compensating delete used when a
/// dataset must be rolled back.
///
/// Note that all implementations are expected to be cheaply cloneable, such that a clone costs
/// about as much as bumping the ref count on an `Arc`.
#[async_trait::async_trait]
pub trait UploadApi: DynClone + std::fmt::Debug + Sync + Send + 'static {
    /// Ask the backend to start a multipart upload to `object_name`
    async fn init_upload(&self, object_name: &str) -> Result<InitUploadResponse>;

    /// Get a pre-signed URL to which the bytes of part `part_number` can be PUT.
    ///
    /// Each URL is valid for a single part transfer, so one is requested for every attempt.
    async fn get_part_upload_url(
        &self,
        object_name: &str,
        upload_id: &str,
        part_number: u32,
    ) -> Result<Url>;

    /// Assemble the uploaded parts into the final object.
    ///
    /// `parts` must be sorted in ascending order by part number.
    async fn complete_upload(
        &self,
        object_name: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<CompleteUploadResponse>;

    /// Discard an incomplete upload and release the parts object storage has reserved for it
    async fn abort_upload(&self, object_name: &str, upload_id: &str)
        -> Result<AbortUploadResponse>;

    /// Delete both the dataset metadata record and the stored object
    async fn delete_dataset_and_file(&self, dataset_id: u64, object_name: &str) -> Result<()>;
}

dyn_clone::clone_trait_object!(UploadApi);

/// Moves the bytes of one part to a pre-signed URL.
#[async_trait::async_trait]
pub trait PartTransport: DynClone + std::fmt::Debug + Sync + Send + 'static {
    /// PUT `data` to `url`, returning the ETag object storage assigned to the part.
    ///
    /// As the body is sent, the cumulative number of bytes of this part transferred so far
    /// should be sent to `progress`.  Callers that don't care about progress drop the receiver,
    /// so failures to send must be ignored.
    ///
    /// Dropping the returned future abandons the transfer.
    async fn put_part(
        &self,
        url: Url,
        data: Bytes,
        progress: mpsc::UnboundedSender<u64>,
    ) -> Result<String>;
}

dyn_clone::clone_trait_object!(PartTransport);

/// State of a server-side download preparation task
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadTaskState {
    Preparing,
    Ready,
}

/// Reply to a download task status query
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadTaskStatus {
    /// Where the prepared file can be fetched from, once there is such a place
    pub url: Option<Url>,

    /// Percent complete, 0 to 100
    pub progress: u8,

    pub state: DownloadTaskState,
}

/// Server-side preparation of paid dataset downloads, which is polled until a download URL is
/// available.
#[async_trait::async_trait]
pub trait DownloadTaskApi: DynClone + std::fmt::Debug + Sync + Send + 'static {
    /// Start preparing a download of `dataset_id`, returning the object name to poll with
    async fn start_download_task(&self, dataset_id: u64) -> Result<String>;

    async fn download_task_status(
        &self,
        dataset_id: u64,
        object_name: &str,
    ) -> Result<DownloadTaskStatus>;
}

dyn_clone::clone_trait_object!(DownloadTaskApi);

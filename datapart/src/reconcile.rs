//! Compensating cleanup when a dataset's metadata and its stored object disagree.
//!
//! Creating a dataset touches two stores: the metadata database and object storage.  If the
//! upload of the file fails after the metadata record was created (or the other way around), the
//! caller rolls both back so neither store references something the other lacks.
use crate::api::UploadApi;
use tracing::{error, info, instrument};

/// Delete both the dataset record `dataset_id` and the stored object `object_name`.
///
/// This is best effort: it is never retried, and a failure is logged rather than returned, since
/// the caller is already handling some other failure when it rolls back.  The return value says
/// whether the rollback succeeded, for callers that want to surface it.
#[instrument(skip(api))]
pub async fn rollback_dataset(api: &dyn UploadApi, dataset_id: u64, object_name: &str) -> bool {
    match api.delete_dataset_and_file(dataset_id, object_name).await {
        Ok(()) => {
            info!("Rolled back dataset record and stored object");
            true
        }
        Err(e) => {
            error!(?e, "Rollback of dataset record and stored object failed");
            false
        }
    }
}

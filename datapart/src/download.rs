//! Waiting for the backend to prepare a paid dataset for download.
//!
//! Paid datasets aren't handed out straight from object storage.  The backend first prepares a
//! copy (watermarking it along the way), which takes a while for large files, so the client
//! starts a preparation task and then polls it until a download URL shows up.
use crate::api::{DownloadTaskApi, DownloadTaskState};
use crate::config::Config;
use crate::Result;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use url::Url;

/// Receives updates while a download task is being polled
#[allow(unused_variables)]
pub trait DownloadProgressCallback: Sync + Send {
    /// The task was started; its status is polled under `object_name`
    fn task_started(&self, dataset_id: u64, object_name: &str) {}

    /// The backend reported the task is `percent` done
    fn progress(&self, percent: u8) {}

    fn ready(&self, url: &Url) {}
}

impl DownloadProgressCallback for () {}

#[derive(Clone, Debug)]
pub struct DownloadTaskPoller {
    api: Box<dyn DownloadTaskApi>,
    interval: Duration,
}

impl DownloadTaskPoller {
    pub fn new(api: impl DownloadTaskApi, interval: Duration) -> Self {
        Self {
            api: Box::new(api),
            interval,
        }
    }

    /// Poller with the interval from [`Config::download_poll_interval`]
    pub fn with_config(api: impl DownloadTaskApi, config: &Config) -> Self {
        Self::new(api, config.download_poll_interval())
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start preparing `dataset_id` and poll until its download URL is available.
    ///
    /// The task is done once the backend says it's ready (or 100% done) *and* it supplies a URL;
    /// until then the status is queried again after every poll interval.  Cancelling `cancel`
    /// stops polling and returns `Ok(None)`.  The backend isn't told; the task just goes
    /// unwatched.
    #[instrument(skip(self, cancel, progress))]
    pub async fn run(
        &self,
        dataset_id: u64,
        cancel: CancellationToken,
        progress: &dyn DownloadProgressCallback,
    ) -> Result<Option<Url>> {
        let object_name = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            object_name = self.api.start_download_task(dataset_id) => object_name?,
        };

        debug!(%object_name, "Download task started");
        progress.task_started(dataset_id, &object_name);

        loop {
            let status = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                status = self.api.download_task_status(dataset_id, &object_name) => status?,
            };

            progress.progress(status.progress);

            if status.progress >= 100 || status.state == DownloadTaskState::Ready {
                if let Some(url) = status.url {
                    info!(host = url.host_str().unwrap_or_default(), "Download is ready");
                    progress.progress(100);
                    progress.ready(&url);
                    return Ok(Some(url));
                }
            }

            debug!(percent = status.progress, "Download not ready yet");

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(self.interval) => {},
            }
        }
    }
}

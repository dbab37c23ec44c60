use std::path::PathBuf;
use url::Url;

/// The configuration settings that control the behavior of uploads and the backend they talk to.
///
/// Most settings can be overridden on a per-upload basis with
/// [`crate::UploadOptions`].
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
pub struct Config {
    /// Base URL of the dataset marketplace REST API.
    ///
    /// All backend endpoints (initiating, completing and aborting multipart uploads, requesting
    /// part URLs, dataset rollback and download tasks) are resolved relative to this URL.
    #[cfg_attr(
        feature = "clap",
        clap(long, global = true, value_name = "URL", env = "DATAPART_API_BASE")
    )]
    pub api_base_url: Option<Url>,

    /// Login token sent to the REST API with every request, as the `auth_token` cookie.
    #[cfg_attr(
        feature = "clap",
        clap(long, global = true, env = "DATAPART_TOKEN", hide_env_values = true)
    )]
    pub auth_token: Option<String>,

    /// The size of each part of a multipart upload.
    ///
    /// Can be specified as an integer, ie "1000000", or with a suffix ie "10MiB".
    ///
    /// Note that the maximum number of parts in an upload is 10,000, so for very large files
    /// this part size may be overridden if it's smaller than 1/10,000th of the size of the
    /// file.
    #[cfg_attr(feature = "clap", clap(long, default_value = "5MiB", global = true))]
    pub multipart_chunk_size: byte_unit::Byte,

    /// The maximum number of parts transferred at the same time.
    ///
    /// A higher number may be necessary to saturate very fast connections to object storage,
    /// but each in-flight part is held in memory in its entirety.
    #[cfg_attr(feature = "clap", clap(long, default_value = "4", global = true))]
    pub max_concurrent_requests: usize,

    /// Directory where upload sessions are persisted so interrupted uploads can resume.
    ///
    /// Defaults to `datapart/sessions` under the platform's local data directory.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "DIR"))]
    pub session_dir: Option<PathBuf>,

    /// How long to wait between two status queries while waiting for a download task.
    #[cfg_attr(feature = "clap", clap(long, default_value = "1800", global = true))]
    pub download_poll_interval_ms: u64,
}

impl Config {
    /// The part size as a plain byte count
    pub fn chunk_size(&self) -> u64 {
        self.multipart_chunk_size.get_bytes() as u64
    }

    /// The directory in which the file-backed session store keeps its records.
    ///
    /// Falls back to the current directory when the platform has no notion of a data directory.
    pub fn session_dir(&self) -> PathBuf {
        self.session_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("datapart")
                .join("sessions")
        })
    }

    pub fn download_poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.download_poll_interval_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        // XXX: This is duplicated here and in the `clap` attributes; there's no better way unless
        // the lib crate unconditionally depends on clap
        Self {
            api_base_url: None,
            auth_token: None,
            multipart_chunk_size: byte_unit::Byte::from_bytes(5 * 1024 * 1024),
            max_concurrent_requests: 4,
            session_dir: None,
            download_poll_interval_ms: 1800,
        }
    }
}

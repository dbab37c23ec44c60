//! Implementations of progress callbacks that render progress bars
use std::{
    borrow::Cow,
    future::Future,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use url::Url;

/// Display a spinner while some long-running but unmeasurable task is running, then hide the
/// spinner when it finishes
pub(crate) async fn with_spinner<S, F, T>(globals: &super::Globals, message: S, task: F) -> T
where
    S: Into<Cow<'static, str>>,
    F: Future<Output = T>,
{
    let spinner = if !hide_progress(globals) {
        indicatif::ProgressBar::new_spinner()
    } else {
        indicatif::ProgressBar::hidden()
    };

    spinner.set_style(spinner_style());
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner.set_message(message);

    let result = task.await;

    spinner.finish_and_clear();

    result
}

/// Progress should be hidden for either of verbose mode (because there will be a flurry of log
/// messages and the progress bar rendering will be all messed up), or quiet mode (because
/// progress bars are not quiet).
pub(crate) fn hide_progress(globals: &super::Globals) -> bool {
    globals.verbose || globals.quiet
}

fn spinner_style() -> indicatif::ProgressStyle {
    indicatif::ProgressStyle::with_template("{spinner:.blue} {msg}")
        .expect("BUG: invalid spinner template")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
}

fn bar(hide_progress: bool, length: u64) -> indicatif::ProgressBar {
    if !hide_progress {
        indicatif::ProgressBar::new(length)
    } else {
        indicatif::ProgressBar::hidden()
    }
}

/// Progress reporting for an upload, rendering a single bar for the bytes of the file object
/// storage has, including parts an earlier attempt already uploaded.
pub(crate) struct UploadProgressReport {
    bar: indicatif::ProgressBar,

    /// What the job adds to every byte count it reports, which has to be taken back out to get
    /// the position in the file
    initial_uploaded_bytes: u64,

    /// Bytes uploaded by earlier attempts, known once the session is established
    resumed_bytes: AtomicU64,
}

impl UploadProgressReport {
    pub(crate) fn new(hide_progress: bool, initial_uploaded_bytes: u64) -> Self {
        let bar = bar(hide_progress, 0);
        bar.set_style(
            indicatif::ProgressStyle::with_template(
                "{spinner:.green} {msg:<40!} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
            )
            .expect("BUG: invalid progress bar template")
            .progress_chars("#>-"),
        );
        bar.set_message("Initiating upload...");

        Self {
            bar,
            initial_uploaded_bytes,
            resumed_bytes: AtomicU64::new(0),
        }
    }
}

impl datapart::UploadProgressCallback for UploadProgressReport {
    fn session_started(
        &self,
        object_name: &str,
        _upload_id: &str,
        total_parts: usize,
        total_bytes: u64,
        resumed_parts: usize,
        resumed_bytes: u64,
    ) {
        self.resumed_bytes.store(resumed_bytes, Ordering::Relaxed);
        self.bar.set_length(total_bytes);
        self.bar.set_position(resumed_bytes);

        if resumed_parts > 0 {
            self.bar.println(format!(
                "Resuming upload of {object_name}: {resumed_parts} of {total_parts} parts ({}) already uploaded",
                indicatif::BinaryBytes(resumed_bytes)
            ));
        }
        self.bar.set_message(object_name.to_string());
    }

    fn part_started(&self, part_number: u32, _part_bytes: u64) {
        self.bar.set_message(format!("Uploading part {part_number}"));
    }

    fn bytes_transferred(&self, _percent: f64, bytes: u64) {
        let job_bytes = bytes.saturating_sub(self.initial_uploaded_bytes);
        self.bar
            .set_position(self.resumed_bytes.load(Ordering::Relaxed) + job_bytes);
    }

    fn paused(&self) {
        self.bar.set_message("Paused");
    }

    fn resumed(&self) {
        self.bar.set_message("Resumed");
    }

    fn upload_completed(&self, object_name: &str, total_bytes: u64) {
        self.bar.set_position(total_bytes);
        self.bar
            .finish_with_message(format!("Stored as {object_name}"));
    }
}

impl Drop for UploadProgressReport {
    fn drop(&mut self) {
        // A stopped or failed upload never finishes the bar
        if !self.bar.is_finished() {
            self.bar.abandon();
        }
    }
}

/// Progress reporting while waiting for the backend to prepare a download
pub(crate) struct DownloadProgressReport {
    bar: indicatif::ProgressBar,
}

impl DownloadProgressReport {
    pub(crate) fn new(hide_progress: bool) -> Self {
        let bar = bar(hide_progress, 100);
        bar.set_style(
            indicatif::ProgressStyle::with_template(
                "{spinner:.green} {msg:<40!} [{bar:30.cyan/blue}] {pos:>3}%",
            )
            .expect("BUG: invalid progress bar template")
            .progress_chars("#>-"),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        bar.set_message("Requesting download...");

        Self { bar }
    }
}

impl datapart::DownloadProgressCallback for DownloadProgressReport {
    fn task_started(&self, dataset_id: u64, _object_name: &str) {
        self.bar
            .set_message(format!("Preparing dataset {dataset_id}"));
    }

    fn progress(&self, percent: u8) {
        self.bar.set_position(percent.into());
    }

    fn ready(&self, _url: &Url) {
        self.bar.finish_with_message("Download ready");
    }
}

impl Drop for DownloadProgressReport {
    fn drop(&mut self) {
        if !self.bar.is_finished() {
            self.bar.abandon();
        }
    }
}

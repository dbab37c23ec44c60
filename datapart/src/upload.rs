//! Resumable, concurrent multipart uploads.
//!
//! An upload is started with [`Uploader::begin`], which returns immediately with an
//! [`UploadJob`] handle while the upload itself runs on a separate tokio task.  The job:
//!
//! 1. Looks up the persisted [`UploadSession`] for the object name, discarding it if it describes
//!    a different file.
//! 2. Without a usable session, asks the backend to initiate a new multipart upload and persists
//!    the new session right away.
//! 3. Splits the source into fixed-size parts and transfers every part not already in the
//!    session's ledger, a bounded number at a time.  Each acknowledged part is recorded in the
//!    ledger and the ledger persisted before progress is reported.
//! 4. Once every part is in the ledger, asks the backend to assemble the object from the parts,
//!    then removes the persisted session.
//!
//! If the process dies mid-upload, calling [`Uploader::begin`] again with the same source and
//! object name picks up where the ledger left off.  Likewise cancelling a job with
//! [`UploadJob::cancel_all`] leaves the session in place so the upload can be resumed later.
use crate::api::{PartTransport, UploadApi};
use crate::config::Config;
use crate::scheduler::{PartOutcome, ScheduleObserver, ScheduleOutcome, Scheduler};
use crate::session::{FileSessionStore, SessionStore, UploadSession};
use crate::source::UploadSource;
use crate::transfer::transfer_part;
use crate::{http::HttpClient, Result};
use futures::Stream;
use snafu::prelude::*;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Instrument};

/// Object storage refuses multipart uploads with more parts than this
pub const MAX_PARTS: u64 = 10_000;

/// Per-upload overrides of the settings in [`Config`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UploadOptions {
    /// Maximum number of part transfers in flight at once
    pub concurrency: Option<usize>,

    /// Size of each part in bytes
    pub chunk_size: Option<u64>,

    /// Added to every byte count reported to the progress callback.
    ///
    /// Callers that display their own running total across several invocations use this to
    /// seed it.
    pub initial_uploaded_bytes: u64,
}

/// Point-in-time view of the progress of an upload job
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UploadProgress {
    /// Bytes reported to the caller: [`UploadOptions::initial_uploaded_bytes`] plus everything
    /// transferred by this job so far, including partially transferred parts
    pub reported_bytes: u64,

    /// Bytes of the file that object storage has, counting parts recorded by earlier attempts
    pub uploaded_bytes: u64,

    pub total_bytes: u64,

    /// `uploaded_bytes` as a percentage of `total_bytes`
    pub percent: f64,

    pub parts_uploaded: usize,
    pub total_parts: usize,

    pub paused: bool,
}

/// How an upload job ended, when it didn't fail
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Every part was transferred and the backend assembled the object
    Completed {
        /// The name the backend stored the object under, which may differ from the name the
        /// upload was started with
        object_name: String,
        upload_id: String,
        total_bytes: u64,
        parts: usize,
    },

    /// The job was cancelled before every part was transferred.
    ///
    /// The session is still persisted, so the upload can be resumed by starting it again, or
    /// abandoned with [`Uploader::cancel`].
    Stopped {
        object_name: String,
        upload_id: String,
        remaining_parts: Vec<u32>,
    },
}

/// Receives updates as an upload job progresses.
///
/// Every method has a default no-op implementation, so implementors only override what they
/// care about.  The methods are called from the job's task, and should not block.
#[allow(unused_variables)]
pub trait UploadProgressCallback: Sync + Send {
    /// The job has a session, either a resumed one or one newly initiated with the backend.
    ///
    /// `resumed_parts` parts totalling `resumed_bytes` were recorded by an earlier attempt and
    /// won't be transferred again.
    fn session_started(
        &self,
        object_name: &str,
        upload_id: &str,
        total_parts: usize,
        total_bytes: u64,
        resumed_parts: usize,
        resumed_bytes: u64,
    ) {
    }

    /// A part transfer is about to begin
    fn part_started(&self, part_number: u32, part_bytes: u64) {}

    /// A part was acknowledged by object storage and recorded in the session
    fn part_uploaded(&self, part_number: u32, part_bytes: u64) {}

    /// The aggregate byte counter changed.
    ///
    /// `bytes` includes [`UploadOptions::initial_uploaded_bytes`].
    fn bytes_transferred(&self, percent: f64, bytes: u64) {}

    /// The job is paused and every in-flight transfer has finished
    fn paused(&self) {}

    fn resumed(&self) {}

    /// The backend reported the name under which the completed object is stored
    fn object_name_assigned(&self, object_name: &str) {}

    /// The backend assembled the object; the upload is finished
    fn upload_completed(&self, object_name: &str, total_bytes: u64) {}
}

/// Starts, cancels and inspects multipart uploads.
///
/// Cheap to clone; clones share the backend client and session store.
#[derive(Clone, Debug)]
pub struct Uploader {
    config: Config,
    api: Box<dyn UploadApi>,
    transport: Box<dyn PartTransport>,
    sessions: Box<dyn SessionStore>,
}

impl Uploader {
    pub fn new(
        config: Config,
        api: impl UploadApi,
        transport: impl PartTransport,
        sessions: impl SessionStore,
    ) -> Self {
        Self {
            config,
            api: Box::new(api),
            transport: Box::new(transport),
            sessions: Box::new(sessions),
        }
    }

    /// Uploader talking to the REST backend at [`Config::api_base_url`], keeping sessions in
    /// files under [`Config::session_dir`]
    pub fn with_http(config: Config) -> Result<Self> {
        let client = HttpClient::new(&config)?;
        let sessions = FileSessionStore::new(config.session_dir());

        Ok(Self::new(config, client.clone(), client, sessions))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start (or resume) uploading `source` to `object_name`.
    ///
    /// This returns as soon as the job is spawned; use the returned [`UploadJob`] to control it
    /// and to wait for the result.  Must be called from within a tokio runtime.
    pub fn begin(
        &self,
        source: Arc<dyn UploadSource>,
        object_name: impl Into<String>,
        options: UploadOptions,
        progress: impl UploadProgressCallback + 'static,
    ) -> UploadJob {
        let object_name = object_name.into();
        let concurrency = options
            .concurrency
            .unwrap_or(self.config.max_concurrent_requests)
            .max(1);
        let chunk_size = options.chunk_size.unwrap_or_else(|| self.config.chunk_size());

        let (pause_sender, pause_receiver) = watch::channel(false);
        let (progress_sender, progress_receiver) = watch::channel(UploadProgress::default());
        let stop = CancellationToken::new();
        let part_tokens = PartTokens::default();

        let job = Job {
            api: self.api.clone(),
            transport: self.transport.clone(),
            sessions: self.sessions.clone(),
            source,
            object_name: object_name.clone(),
            chunk_size,
            concurrency,
            initial_uploaded_bytes: options.initial_uploaded_bytes,
            callback: Arc::new(progress),
            progress: progress_sender,
            paused: pause_receiver,
            stop: stop.clone(),
            part_tokens: part_tokens.clone(),
        };

        let span = tracing::info_span!("upload", object_name = %object_name);
        let task = tokio::spawn(job.run().instrument(span));

        UploadJob {
            object_name,
            pause: pause_sender,
            stop,
            part_tokens,
            progress: progress_receiver,
            task,
        }
    }

    /// Alternative to [`Self::begin`] for callers that only care about progress through
    /// [`UploadJob::progress`], if at all
    pub fn begin_without_progress(
        &self,
        source: Arc<dyn UploadSource>,
        object_name: impl Into<String>,
        options: UploadOptions,
    ) -> UploadJob {
        struct NoProgress {}
        impl UploadProgressCallback for NoProgress {}

        self.begin(source, object_name, options, NoProgress {})
    }

    /// Tell the backend to abort the multipart upload `upload_id`, discarding every part it
    /// received.  Returns the backend's message.
    ///
    /// The persisted session is left alone; remove it with [`Self::discard_session`] once the
    /// upload is no longer wanted.
    #[instrument(skip(self), err)]
    pub async fn cancel(&self, object_name: &str, upload_id: &str) -> Result<String> {
        let response = self.api.abort_upload(object_name, upload_id).await?;
        info!(message = %response.message, "Multipart upload aborted");

        Ok(response.message)
    }

    /// Forget the persisted session for `object_name`, so the next upload to it starts over
    pub async fn discard_session(&self, object_name: &str) -> Result<()> {
        self.sessions.clear(object_name).await
    }

    /// The persisted session for `object_name`, if any
    pub async fn session(&self, object_name: &str) -> Result<Option<UploadSession>> {
        self.sessions.load(object_name).await
    }

    /// The persisted session an upload of `source` to `object_name` with `options` would resume,
    /// if there is one.  A session left behind by a different file, or by an upload split into
    /// parts of a different size, doesn't count.
    pub async fn resumable_session(
        &self,
        source: &dyn UploadSource,
        object_name: &str,
        options: &UploadOptions,
    ) -> Result<Option<UploadSession>> {
        let chunk_size = effective_chunk_size(
            source.size(),
            options.chunk_size.unwrap_or_else(|| self.config.chunk_size()),
        );

        Ok(self
            .sessions
            .load(object_name)
            .await?
            .filter(|session| session.matches(source.size(), source.name(), chunk_size)))
    }

    /// Every persisted session
    pub async fn sessions(&self) -> Result<Vec<UploadSession>> {
        self.sessions.list().await
    }
}

/// Handle to a running upload job.
///
/// Dropping the handle without calling [`Self::wait`] detaches the job, which keeps running
/// unless it's paused at the time, in which case it stops since nothing can resume it anymore.
#[derive(Debug)]
pub struct UploadJob {
    object_name: String,
    pause: watch::Sender<bool>,
    stop: CancellationToken,
    part_tokens: PartTokens,
    progress: watch::Receiver<UploadProgress>,
    task: JoinHandle<Result<UploadOutcome>>,
}

impl UploadJob {
    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    /// Stop launching part transfers.  Transfers already in flight run to completion.
    pub fn pause(&self) {
        debug!(object_name = %self.object_name, "Pausing upload");
        self.pause.send_replace(true);
    }

    /// Continue launching part transfers with the next part not yet transferred
    pub fn resume(&self) {
        debug!(object_name = %self.object_name, "Resuming upload");
        self.pause.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.pause.borrow()
    }

    /// Abort every in-flight part transfer and stop the job.
    ///
    /// The job then ends with [`UploadOutcome::Stopped`], leaving the session persisted.
    pub fn cancel_all(&self) {
        debug!(object_name = %self.object_name, "Cancelling upload");
        self.stop.cancel();
    }

    /// Abort the transfer of one part, if it's in flight.
    ///
    /// An aborted part isn't a failure, but it does stop the job from launching more parts, so
    /// the job ends with [`UploadOutcome::Stopped`] once the remaining transfers finish.
    pub fn cancel_part(&self, part_number: u32) -> bool {
        self.part_tokens.cancel(part_number)
    }

    /// Watch the job's progress.  The receiver always holds the latest state.
    pub fn progress(&self) -> watch::Receiver<UploadProgress> {
        self.progress.clone()
    }

    /// The job's progress as a stream, yielding the current state first
    pub fn progress_stream(&self) -> impl Stream<Item = UploadProgress> + Send + 'static {
        tokio_stream::wrappers::WatchStream::new(self.progress.clone())
    }

    /// Wait for the job to finish
    pub async fn wait(self) -> Result<UploadOutcome> {
        let object_name = self.object_name;

        self.task
            .await
            .context(crate::error::UploadTaskFailedSnafu { object_name })?
    }
}

/// Cancellation tokens of the parts currently in flight, shared between the job and its handle
#[derive(Clone, Debug, Default)]
struct PartTokens {
    tokens: Arc<Mutex<HashMap<u32, CancellationToken>>>,
}

impl PartTokens {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u32, CancellationToken>> {
        self.tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A token for `part_number` which is also cancelled when `job` is
    fn register(&self, part_number: u32, job: &CancellationToken) -> CancellationToken {
        let token = job.child_token();
        self.lock().insert(part_number, token.clone());
        token
    }

    fn remove(&self, part_number: u32) {
        self.lock().remove(&part_number);
    }

    fn cancel(&self, part_number: u32) -> bool {
        match self.lock().get(&part_number) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// How a file is split into parts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Partition {
    pub file_size: u64,
    pub chunk_size: u64,
    pub part_count: u32,
}

impl Partition {
    /// Split `file_size` bytes into parts of `chunk_size` bytes, the last of which may be shorter.
    ///
    /// If that would produce more than [`MAX_PARTS`] parts, the chunk size is raised to the
    /// smallest size that fits.  An empty file is uploaded as a single empty part, since a
    /// multipart upload needs at least one part.
    pub fn new(file_size: u64, chunk_size: u64) -> Self {
        let requested_chunk_size = chunk_size;
        let chunk_size = effective_chunk_size(file_size, chunk_size);

        if chunk_size > requested_chunk_size.max(1) {
            warn!(
                file_size,
                requested_chunk_size,
                chunk_size,
                "Chunk size would exceed the maximum part count; using a larger chunk size"
            );
        }

        let part_count = div_ceil(file_size, chunk_size).max(1);

        Self {
            file_size,
            chunk_size,
            // Bounded by MAX_PARTS
            part_count: part_count as u32,
        }
    }

    /// Byte range of the 1-based `part_number`
    pub fn range(&self, part_number: u32) -> Range<u64> {
        let start = (u64::from(part_number) - 1) * self.chunk_size;
        let end = (start + self.chunk_size).min(self.file_size);

        start.min(end)..end
    }

    pub fn part_numbers(&self) -> impl Iterator<Item = u32> {
        1..=self.part_count
    }
}

/// The part size an upload of `file_size` bytes actually uses when `chunk_size` is requested.
///
/// That's `chunk_size` unless it would take more than [`MAX_PARTS`] parts, in which case it's the
/// smallest size that fits.  Sessions record the size actually used, so this is what to compare
/// against when deciding if a session can be resumed.
pub fn effective_chunk_size(file_size: u64, chunk_size: u64) -> u64 {
    let chunk_size = chunk_size.max(1);

    if div_ceil(file_size, chunk_size) > MAX_PARTS {
        div_ceil(file_size, MAX_PARTS)
    } else {
        chunk_size
    }
}

fn div_ceil(numerator: u64, denominator: u64) -> u64 {
    (numerator + denominator - 1) / denominator
}

/// Everything a spawned upload job owns
struct Job {
    api: Box<dyn UploadApi>,
    transport: Box<dyn PartTransport>,
    sessions: Box<dyn SessionStore>,
    source: Arc<dyn UploadSource>,
    object_name: String,
    chunk_size: u64,
    concurrency: usize,
    initial_uploaded_bytes: u64,
    callback: Arc<dyn UploadProgressCallback>,
    progress: watch::Sender<UploadProgress>,
    paused: watch::Receiver<bool>,
    stop: CancellationToken,
    part_tokens: PartTokens,
}

impl Job {
    async fn run(self) -> Result<UploadOutcome> {
        let file_size = self.source.size();
        let partition = Partition::new(file_size, self.chunk_size);

        let session = self.establish_session(&partition).await?;
        let upload_id = session.upload_id.clone();

        let pending = partition
            .part_numbers()
            .filter(|part_number| !session.is_recorded(*part_number))
            .collect::<Vec<_>>();

        let tracker = ProgressTracker::new(
            &partition,
            self.initial_uploaded_bytes,
            session.recorded_bytes(),
            session.parts.len(),
        );

        info!(
            upload_id = %upload_id,
            file_size,
            chunk_size = partition.chunk_size,
            total_parts = partition.part_count,
            resumed_parts = session.parts.len(),
            "Starting multipart upload"
        );
        self.callback.session_started(
            &self.object_name,
            &upload_id,
            partition.part_count as usize,
            file_size,
            session.parts.len(),
            session.recorded_bytes(),
        );
        self.publish(&tracker);

        let session = tokio::sync::Mutex::new(session);
        let mut scheduler = Scheduler::new(
            pending,
            self.concurrency,
            self.paused.clone(),
            self.stop.clone(),
        );
        let mut observer = JobObserver {
            job: &self,
            tracker: &tracker,
        };

        let outcome = scheduler
            .run(
                |part_number| self.upload_part(part_number, &partition, &session, &tracker),
                &mut observer,
            )
            .await?;

        match outcome {
            ScheduleOutcome::Drained => {
                let session = session.into_inner();
                self.complete(session, &tracker).await
            }
            ScheduleOutcome::Stopped { remaining } => {
                info!(
                    upload_id = %upload_id,
                    remaining_parts = remaining.len(),
                    "Upload stopped before all parts were transferred; the session can be resumed"
                );
                self.publish(&tracker);

                Ok(UploadOutcome::Stopped {
                    object_name: self.object_name.clone(),
                    upload_id,
                    remaining_parts: remaining,
                })
            }
        }
    }

    /// Resume the persisted session if it describes this source, or initiate a new upload
    async fn establish_session(&self, partition: &Partition) -> Result<UploadSession> {
        let file_name = self.source.name();

        if let Some(session) = self.sessions.load(&self.object_name).await? {
            if session.matches(partition.file_size, file_name, partition.chunk_size) {
                debug!(upload_id = %session.upload_id, parts = session.parts.len(), "Resuming persisted upload session");
                return Ok(session);
            }

            debug!(
                upload_id = %session.upload_id,
                persisted_size = session.file_size,
                persisted_name = %session.file_name,
                "Persisted upload session describes a different file; ignoring it"
            );
        }

        let response = self.api.init_upload(&self.object_name).await?;
        let session = UploadSession::new(
            response.upload_id,
            self.object_name.clone(),
            partition.file_size,
            file_name,
            partition.chunk_size,
        );
        self.sessions.save(&session).await?;

        debug!(upload_id = %session.upload_id, "Initiated new multipart upload");

        Ok(session)
    }

    /// Transfer one part: get its URL, read its bytes, send them, and record the result
    async fn upload_part(
        &self,
        part_number: u32,
        partition: &Partition,
        session: &tokio::sync::Mutex<UploadSession>,
        tracker: &ProgressTracker,
    ) -> Result<PartOutcome> {
        let range = partition.range(part_number);
        let part_bytes = range.end - range.start;
        let token = self.part_tokens.register(part_number, &self.stop);

        let result = async {
            let upload_id = session.lock().await.upload_id.clone();
            let url = self
                .api
                .get_part_upload_url(&self.object_name, &upload_id, part_number)
                .await?;
            let data = self.source.read_range(range).await?;

            self.callback.part_started(part_number, part_bytes);
            debug!(part_number, part_bytes, "Transferring part");

            transfer_part(
                &*self.transport,
                part_number,
                url,
                data,
                &token,
                |bytes| {
                    tracker.part_progress(part_number, bytes.min(part_bytes));
                    self.publish(tracker);
                },
            )
            .await
        }
        .await;

        self.part_tokens.remove(part_number);

        let etag = match result {
            Ok(etag) => etag,
            Err(e) => {
                tracker.part_abandoned(part_number);
                self.publish(tracker);

                return if e.is_abort() {
                    Ok(PartOutcome::Aborted)
                } else {
                    Err(e)
                };
            }
        };

        {
            let mut session = session.lock().await;
            session.record_part(part_number, etag, part_bytes);
            self.sessions.save(&session).await?;
        }

        debug!(part_number, "Part recorded");
        tracker.part_recorded(part_number, part_bytes);
        self.callback.part_uploaded(part_number, part_bytes);
        self.publish(tracker);

        Ok(PartOutcome::Uploaded)
    }

    /// Every part is recorded; have the backend assemble the object
    async fn complete(&self, session: UploadSession, tracker: &ProgressTracker) -> Result<UploadOutcome> {
        let parts = session.completed_parts();

        info!(upload_id = %session.upload_id, parts = parts.len(), "Completing multipart upload");
        let response = self
            .api
            .complete_upload(&self.object_name, &session.upload_id, &parts)
            .await?;

        if let Err(e) = self.sessions.clear(&self.object_name).await {
            // The upload is done regardless; a leftover session is only stale
            warn!(?e, "Unable to remove the session of a completed upload");
        }

        let object_name = match response.object_name {
            Some(name) => {
                self.callback.object_name_assigned(&name);
                name
            }
            None => self.object_name.clone(),
        };

        self.publish(tracker);
        self.callback
            .upload_completed(&object_name, session.file_size);
        info!(%object_name, message = %response.message, "Multipart upload completed");

        Ok(UploadOutcome::Completed {
            object_name,
            upload_id: session.upload_id,
            total_bytes: session.file_size,
            parts: parts.len(),
        })
    }

    fn publish(&self, tracker: &ProgressTracker) {
        let progress = tracker.snapshot(*self.paused.borrow());

        self.callback
            .bytes_transferred(progress.percent, progress.reported_bytes);
        self.progress.send_replace(progress);
    }
}

struct JobObserver<'a> {
    job: &'a Job,
    tracker: &'a ProgressTracker,
}

impl ScheduleObserver for JobObserver<'_> {
    fn part_launched(&mut self, part_number: u32, in_flight: usize) {
        debug!(part_number, in_flight, "Launched part transfer");
    }

    fn paused(&mut self, remaining: usize) {
        info!(remaining, "Upload paused");
        self.job.callback.paused();
        self.job.publish(self.tracker);
    }

    fn resumed(&mut self) {
        info!("Upload resumed");
        self.job.callback.resumed();
        self.job.publish(self.tracker);
    }
}

/// The aggregate byte counter of one job.
///
/// Rather than keeping a running total, the counter is recomputed from the sizes of the parts
/// this job recorded plus the partial progress of each part in flight, so a part that's aborted
/// halfway simply drops out of the sum.
struct ProgressTracker {
    total_bytes: u64,
    total_parts: usize,
    initial_uploaded_bytes: u64,
    resumed_bytes: u64,
    resumed_parts: usize,
    state: Mutex<TrackerState>,
}

#[derive(Default)]
struct TrackerState {
    recorded_bytes: u64,
    recorded_parts: usize,
    in_flight: HashMap<u32, u64>,
}

impl ProgressTracker {
    fn new(
        partition: &Partition,
        initial_uploaded_bytes: u64,
        resumed_bytes: u64,
        resumed_parts: usize,
    ) -> Self {
        Self {
            total_bytes: partition.file_size,
            total_parts: partition.part_count as usize,
            initial_uploaded_bytes,
            resumed_bytes,
            resumed_parts,
            state: Mutex::new(TrackerState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn part_progress(&self, part_number: u32, bytes: u64) {
        self.lock().in_flight.insert(part_number, bytes);
    }

    fn part_abandoned(&self, part_number: u32) {
        self.lock().in_flight.remove(&part_number);
    }

    fn part_recorded(&self, part_number: u32, part_bytes: u64) {
        let mut state = self.lock();
        state.in_flight.remove(&part_number);
        state.recorded_bytes += part_bytes;
        state.recorded_parts += 1;
    }

    fn snapshot(&self, paused: bool) -> UploadProgress {
        let state = self.lock();
        let transferred = state.recorded_bytes + state.in_flight.values().sum::<u64>();
        let uploaded_bytes = self.resumed_bytes + transferred;
        let parts_uploaded = self.resumed_parts + state.recorded_parts;

        let percent = if self.total_bytes == 0 {
            if parts_uploaded >= self.total_parts {
                100.0
            } else {
                0.0
            }
        } else {
            uploaded_bytes as f64 * 100.0 / self.total_bytes as f64
        };

        UploadProgress {
            reported_bytes: self.initial_uploaded_bytes + transferred,
            uploaded_bytes,
            total_bytes: self.total_bytes,
            percent,
            parts_uploaded,
            total_parts: self.total_parts,
            paused,
        }
    }
}

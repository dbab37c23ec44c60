//! An in-memory stand-in for both the marketplace backend and object storage.
//!
//! [`MockBackend`] implements [`UploadApi`] and [`PartTransport`], keeps every part it receives,
//! and assembles objects on completion so tests can check the bytes that ended up stored.  It
//! also records every call, tracks how many part transfers were in flight at once, and can be
//! told to fail or hold specific parts.
use bytes::{Bytes, BytesMut};
use datapart::api::{
    AbortUploadResponse, CompleteUploadResponse, CompletedPart, InitUploadResponse,
    PartTransport, UploadApi,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use url::Url;

/// Host part of every URL the mock hands out for part transfers
pub const MOCK_OBJSTORE_HOST: &str = "objstore.mock";

/// Every interaction with the mock, in the order it happened
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    InitUpload {
        object_name: String,
    },
    GetPartUrl {
        upload_id: String,
        part_number: u32,
    },
    PutPart {
        upload_id: String,
        part_number: u32,
        len: usize,
    },
    /// A part transfer failed because of [`MockBackend::fail_part`]
    PartFailed {
        part_number: u32,
    },
    CompleteUpload {
        object_name: String,
        upload_id: String,
        parts: Vec<CompletedPart>,
    },
    AbortUpload {
        object_name: String,
        upload_id: String,
    },
    DeleteDataset {
        dataset_id: u64,
        object_name: String,
    },
}

#[derive(Debug, Default)]
struct MockUpload {
    object_name: String,
    parts: BTreeMap<u32, (String, Bytes)>,
    aborted: bool,
}

#[derive(Debug, Default)]
struct State {
    next_upload_id: usize,
    uploads: HashMap<String, MockUpload>,
    objects: HashMap<String, Bytes>,
    calls: Vec<Call>,
    failing_parts: HashSet<u32>,
    fail_completion: bool,
    fail_deletion: bool,
    held_parts: HashMap<u32, Arc<Semaphore>>,
    stored_object_prefix: Option<String>,
    part_delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Mock backend and object store.  Clones share all state.
#[derive(Clone, Debug, Default)]
pub struct MockBackend {
    inner: Arc<Inner>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap()
    }

    /// Every transfer of `part_number` fails with an HTTP 500 from object storage
    pub fn fail_part(&self, part_number: u32) {
        self.state().failing_parts.insert(part_number);
    }

    /// Undo every [`Self::fail_part`]
    pub fn clear_part_failures(&self) {
        self.state().failing_parts.clear();
    }

    pub fn fail_completion(&self) {
        self.state().fail_completion = true;
    }

    pub fn fail_deletion(&self) {
        self.state().fail_deletion = true;
    }

    /// Transfers of `part_number` block after reporting half their bytes until released with
    /// [`Self::release_part`], or until the transfer is abandoned
    pub fn hold_part(&self, part_number: u32) {
        self.state()
            .held_parts
            .insert(part_number, Arc::new(Semaphore::new(0)));
    }

    pub fn release_part(&self, part_number: u32) {
        if let Some(gate) = self.state().held_parts.get(&part_number) {
            gate.add_permits(1);
        }
    }

    /// Every part transfer takes at least this long
    pub fn set_part_delay(&self, delay: Duration) {
        self.state().part_delay = Some(delay);
    }

    /// On completion, report that the object was stored under its name with this prefix
    pub fn assign_object_names_with_prefix(&self, prefix: impl Into<String>) {
        self.state().stored_object_prefix = Some(prefix.into());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Part numbers whose transfer object storage accepted, in the order it accepted them
    pub fn uploaded_parts(&self) -> Vec<u32> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::PutPart { part_number, .. } => Some(*part_number),
                _ => None,
            })
            .collect()
    }

    /// Part numbers for which an upload URL was requested, in order
    pub fn requested_part_urls(&self) -> Vec<u32> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::GetPartUrl { part_number, .. } => Some(*part_number),
                _ => None,
            })
            .collect()
    }

    /// Part numbers whose transfer failed by injection, in order
    pub fn failed_parts(&self) -> Vec<u32> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::PartFailed { part_number } => Some(*part_number),
                _ => None,
            })
            .collect()
    }

    pub fn init_count(&self) -> usize {
        self.count_calls(|call| matches!(call, Call::InitUpload { .. }))
    }

    /// Each completion request: the upload ID and the parts list submitted
    pub fn completions(&self) -> Vec<(String, Vec<CompletedPart>)> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::CompleteUpload {
                    upload_id, parts, ..
                } => Some((upload_id.clone(), parts.clone())),
                _ => None,
            })
            .collect()
    }

    fn count_calls(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.state().calls.iter().filter(|call| predicate(call)).count()
    }

    /// The most part transfers that were ever in flight at the same time
    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` part transfers are in flight
    pub async fn wait_for_in_flight(&self, count: usize) {
        while self.in_flight() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// The assembled contents of a completed object, under the name it was stored as
    pub fn object(&self, object_name: &str) -> Option<Bytes> {
        self.state().objects.get(object_name).cloned()
    }

    pub fn is_aborted(&self, upload_id: &str) -> bool {
        self.state()
            .uploads
            .get(upload_id)
            .map_or(false, |upload| upload.aborted)
    }

    /// Parts object storage holds for `upload_id`
    pub fn stored_part_numbers(&self, upload_id: &str) -> Vec<u32> {
        self.state()
            .uploads
            .get(upload_id)
            .map(|upload| upload.parts.keys().copied().collect())
            .unwrap_or_default()
    }

    fn part_url(upload_id: &str, part_number: u32) -> Url {
        format!("http://{MOCK_OBJSTORE_HOST}/uploads/{upload_id}/parts/{part_number}")
            .parse()
            .unwrap()
    }

    /// Inverse of [`Self::part_url`]
    fn parse_part_url(url: &Url) -> Option<(String, u32)> {
        let segments = url.path_segments()?.collect::<Vec<_>>();

        match segments.as_slice() {
            ["uploads", upload_id, "parts", part_number] => {
                Some((upload_id.to_string(), part_number.parse().ok()?))
            }
            _ => None,
        }
    }

    fn unknown_upload<T>(endpoint: &str, upload_id: &str) -> datapart::Result<T> {
        datapart::error::ApiRejectedSnafu {
            endpoint,
            code: 404u32,
            msg: format!("no such upload '{upload_id}'"),
        }
        .fail()
    }
}

/// Counts a transfer as in flight for as long as it lives, including when it's dropped midway
struct InFlightGuard<'a> {
    inner: &'a Inner,
}

impl<'a> InFlightGuard<'a> {
    fn new(inner: &'a Inner) -> Self {
        let now = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        inner.max_in_flight.fetch_max(now, Ordering::SeqCst);

        Self { inner }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl UploadApi for MockBackend {
    async fn init_upload(&self, object_name: &str) -> datapart::Result<InitUploadResponse> {
        let mut state = self.state();
        state.next_upload_id += 1;
        let upload_id = format!("upload-{}", state.next_upload_id);

        state.calls.push(Call::InitUpload {
            object_name: object_name.to_string(),
        });
        state.uploads.insert(
            upload_id.clone(),
            MockUpload {
                object_name: object_name.to_string(),
                ..Default::default()
            },
        );

        Ok(InitUploadResponse {
            upload_id,
            object_name: Some(object_name.to_string()),
        })
    }

    async fn get_part_upload_url(
        &self,
        _object_name: &str,
        upload_id: &str,
        part_number: u32,
    ) -> datapart::Result<Url> {
        let mut state = self.state();
        state.calls.push(Call::GetPartUrl {
            upload_id: upload_id.to_string(),
            part_number,
        });

        if !state.uploads.contains_key(upload_id) {
            return Self::unknown_upload("dataset/get-part-url", upload_id);
        }

        Ok(Self::part_url(upload_id, part_number))
    }

    async fn complete_upload(
        &self,
        object_name: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> datapart::Result<CompleteUploadResponse> {
        let mut state = self.state();
        state.calls.push(Call::CompleteUpload {
            object_name: object_name.to_string(),
            upload_id: upload_id.to_string(),
            parts: parts.to_vec(),
        });

        if state.fail_completion {
            return datapart::error::ApiRejectedSnafu {
                endpoint: "dataset/complete-multipart",
                code: 500u32,
                msg: "injected completion failure",
            }
            .fail();
        }

        let Some(upload) = state.uploads.get(upload_id) else {
            return Self::unknown_upload("dataset/complete-multipart", upload_id);
        };

        // Real object storage insists on ascending part numbers and matching ETags
        let mut object = BytesMut::new();
        let mut previous = 0;
        for part in parts {
            let valid = part.part_number > previous
                && upload
                    .parts
                    .get(&part.part_number)
                    .map_or(false, |(etag, _)| *etag == part.etag);
            if !valid {
                return datapart::error::ApiRejectedSnafu {
                    endpoint: "dataset/complete-multipart",
                    code: 400u32,
                    msg: format!("invalid part {} in part list", part.part_number),
                }
                .fail();
            }

            previous = part.part_number;
            object.extend_from_slice(&upload.parts[&part.part_number].1);
        }

        let stored_name = match &state.stored_object_prefix {
            Some(prefix) => format!("{prefix}{}", upload.object_name),
            None => upload.object_name.clone(),
        };
        state.uploads.remove(upload_id);
        state.objects.insert(stored_name.clone(), object.freeze());

        Ok(CompleteUploadResponse {
            object_name: Some(stored_name),
            message: "upload completed".to_string(),
        })
    }

    async fn abort_upload(
        &self,
        object_name: &str,
        upload_id: &str,
    ) -> datapart::Result<AbortUploadResponse> {
        let mut state = self.state();
        state.calls.push(Call::AbortUpload {
            object_name: object_name.to_string(),
            upload_id: upload_id.to_string(),
        });

        match state.uploads.get_mut(upload_id) {
            Some(upload) => {
                upload.aborted = true;
                upload.parts.clear();

                Ok(AbortUploadResponse {
                    message: format!("upload {upload_id} aborted"),
                })
            }
            None => Self::unknown_upload("dataset/abort-multipart", upload_id),
        }
    }

    async fn delete_dataset_and_file(
        &self,
        dataset_id: u64,
        object_name: &str,
    ) -> datapart::Result<()> {
        let mut state = self.state();
        state.calls.push(Call::DeleteDataset {
            dataset_id,
            object_name: object_name.to_string(),
        });

        if state.fail_deletion {
            return datapart::error::ApiRejectedSnafu {
                endpoint: "dataset/delete-dataset",
                code: 500u32,
                msg: "injected deletion failure",
            }
            .fail();
        }

        state.objects.remove(object_name);

        Ok(())
    }
}

#[async_trait::async_trait]
impl PartTransport for MockBackend {
    async fn put_part(
        &self,
        url: Url,
        data: Bytes,
        progress: mpsc::UnboundedSender<u64>,
    ) -> datapart::Result<String> {
        let _in_flight = InFlightGuard::new(&self.inner);

        let Some((upload_id, part_number)) = Self::parse_part_url(&url) else {
            return datapart::error::PartUploadRejectedSnafu {
                host: url.host_str().unwrap_or_default(),
                status: reqwest::StatusCode::NOT_FOUND,
                body: "not a part URL",
            }
            .fail();
        };

        let (gate, delay, fail) = {
            let state = self.state();
            (
                state.held_parts.get(&part_number).cloned(),
                state.part_delay,
                state.failing_parts.contains(&part_number),
            )
        };

        // Give other transfers a chance to start, as a real network transfer would
        tokio::task::yield_now().await;
        let _ = progress.send(data.len() as u64 / 2);

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(gate) = gate {
            // A closed semaphore is never used, so this only fails if the test is misbehaving
            let _permit = gate.acquire().await.unwrap();
        }

        if fail {
            self.state().calls.push(Call::PartFailed { part_number });
            return datapart::error::PartUploadRejectedSnafu {
                host: MOCK_OBJSTORE_HOST,
                status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                body: format!("injected failure of part {part_number}"),
            }
            .fail();
        }

        let _ = progress.send(data.len() as u64);

        let mut state = self.state();
        let etag = format!("\"{upload_id}-{part_number}-{}\"", data.len());
        match state.uploads.get_mut(&upload_id) {
            Some(upload) if !upload.aborted => {
                upload.parts.insert(part_number, (etag.clone(), data.clone()));
            }
            _ => {
                return datapart::error::PartUploadRejectedSnafu {
                    host: MOCK_OBJSTORE_HOST,
                    status: reqwest::StatusCode::NOT_FOUND,
                    body: format!("no such upload '{upload_id}'"),
                }
                .fail();
            }
        }

        state.calls.push(Call::PutPart {
            upload_id,
            part_number,
            len: data.len(),
        });

        Ok(etag)
    }
}

//! A fake marketplace backend served over real HTTP, for testing [`datapart::HttpClient`] end to
//! end.
//!
//! Serves the REST endpoints under `/api/`, wrapping every response in the backend's
//! `{ code, msg, data }` envelope, plus a pre-signed-URL style `PUT` endpoint standing in for
//! object storage.  Everything is kept in memory.
use crate::Result;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use url::Url;

/// Login token the server's default [`datapart::Config`] carries, and the only one it accepts
pub const TEST_TOKEN: &str = "test-token";

/// What the backend answers REST calls without a valid `auth_token` cookie with
pub const NOT_LOGGED_IN_MSG: &str = "please log in first";

/// Prefix the server adds to object names when completing an upload
pub const STORED_OBJECT_PREFIX: &str = "stored/";

/// One step of a scripted download task: what a status query returns
#[derive(Clone, Debug)]
pub struct DownloadStep {
    /// Sent verbatim; the real backend sends both numbers and numeric strings
    pub progress: Value,
    pub status: u8,
    pub ready: bool,
}

/// A part `PUT` the server received
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartRequest {
    pub upload_id: String,
    pub part_number: u32,
    pub len: usize,
    pub authorization: Option<String>,
    pub auth_token: Option<String>,
}

#[derive(Debug, Default)]
struct Upload {
    object_name: String,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Debug, Default)]
struct ServerState {
    origin: Option<Url>,
    next_upload_id: usize,
    uploads: HashMap<String, Upload>,
    objects: HashMap<String, Bytes>,
    aborted: Vec<String>,
    deleted: Vec<(u64, String)>,
    api_auth_tokens: Vec<Option<String>>,
    part_requests: Vec<PartRequest>,
    rejections: HashMap<String, (u32, String)>,
    omit_etag: bool,
    download_script: VecDeque<DownloadStep>,
    download_polls: usize,
}

#[derive(Clone, Debug, Default)]
struct SharedState(Arc<Mutex<ServerState>>);

impl SharedState {
    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.0.lock().unwrap()
    }

    /// Note the request's credentials, then refuse it the way the backend does if it isn't
    /// logged in or if a rejection is queued for `endpoint`
    fn api_request(&self, endpoint: &str, headers: &HeaderMap) -> Option<Json<Value>> {
        let mut state = self.lock();
        let auth_token = auth_token(headers);
        state.api_auth_tokens.push(auth_token.clone());

        // Like the backend, a failed login check is still HTTP 200
        if auth_token.as_deref() != Some(TEST_TOKEN) {
            return Some(failure(401, NOT_LOGGED_IN_MSG));
        }

        state
            .rejections
            .remove(endpoint)
            .map(|(code, msg)| failure(code, msg))
    }
}

fn authorization(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

/// The `auth_token` cookie, if the request has one
fn auth_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|cookie| cookie.trim().split_once('='))
        .find(|(name, _)| *name == datapart::http::AUTH_COOKIE_NAME)
        .map(|(_, value)| value.to_string())
}

fn success(data: Value) -> Json<Value> {
    Json(json!({ "code": 200, "msg": "success", "data": data }))
}

fn failure(code: u32, msg: impl Into<String>) -> Json<Value> {
    Json(json!({ "code": code, "msg": msg.into(), "data": null }))
}

/// Stand-in for the MD5 object storage uses as ETag
fn etag_of(data: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);

    format!("\"{:016x}\"", hasher.finish())
}

/// The fake backend.  The server stops when this is dropped.
pub struct FakeBackendServer {
    origin: Url,
    state: SharedState,
    task: JoinHandle<()>,
}

impl FakeBackendServer {
    /// Start listening on an ephemeral localhost port
    pub async fn start() -> Result<Self> {
        let state = SharedState::default();

        let router = Router::new()
            .route("/api/dataset/init-multipart", post(init_multipart))
            .route("/api/dataset/get-part-url", post(get_part_url))
            .route("/api/dataset/complete-multipart", post(complete_multipart))
            .route("/api/dataset/abort-multipart", post(abort_multipart))
            .route("/api/dataset/delete-dataset", post(delete_dataset))
            .route("/api/dataset/download-paid", get(download_paid))
            .route("/api/dataset/download-status", get(download_status))
            .route("/objstore/{upload_id}/{part_number}", put(put_part))
            .route("/files/{*object_name}", get(get_file))
            .layer(DefaultBodyLimit::disable())
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let origin: Url = format!("http://{}/", listener.local_addr()?).parse()?;
        state.lock().origin = Some(origin.clone());

        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::error!(?e, "Fake backend server failed");
            }
        });

        tracing::debug!(%origin, "Fake backend server listening");

        Ok(Self {
            origin,
            state,
            task,
        })
    }

    /// Base URL of the REST API, without the trailing slash the client is expected to add
    pub fn api_base_url(&self) -> Url {
        self.origin.join("api").unwrap()
    }

    /// Config pointing at this server, authenticated with [`TEST_TOKEN`]
    pub fn config(&self) -> datapart::Config {
        datapart::Config {
            api_base_url: Some(self.api_base_url()),
            auth_token: Some(TEST_TOKEN.to_string()),
            ..Default::default()
        }
    }

    /// Make the next request to `endpoint` (e.g. `dataset/complete-multipart`) fail with an
    /// envelope carrying `code` and `msg`
    pub fn reject_next(&self, endpoint: &str, code: u32, msg: &str) {
        self.state
            .lock()
            .rejections
            .insert(endpoint.to_string(), (code, msg.to_string()));
    }

    /// Accept part uploads without returning an ETag header
    pub fn omit_etag(&self) {
        self.state.lock().omit_etag = true;
    }

    /// Statuses returned by successive download status queries; the last one repeats
    pub fn script_download(&self, steps: impl IntoIterator<Item = DownloadStep>) {
        self.state.lock().download_script = steps.into_iter().collect();
    }

    pub fn download_polls(&self) -> usize {
        self.state.lock().download_polls
    }

    pub fn object(&self, object_name: &str) -> Option<Bytes> {
        self.state.lock().objects.get(object_name).cloned()
    }

    pub fn aborted_uploads(&self) -> Vec<String> {
        self.state.lock().aborted.clone()
    }

    pub fn deleted_datasets(&self) -> Vec<(u64, String)> {
        self.state.lock().deleted.clone()
    }

    /// The `auth_token` cookie of every REST API request, in order
    pub fn api_auth_tokens(&self) -> Vec<Option<String>> {
        self.state.lock().api_auth_tokens.clone()
    }

    pub fn part_requests(&self) -> Vec<PartRequest> {
        self.state.lock().part_requests.clone()
    }
}

impl Drop for FakeBackendServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitRequest {
    file_name: String,
}

async fn init_multipart(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<InitRequest>,
) -> Json<Value> {
    if let Some(rejection) = state.api_request("dataset/init-multipart", &headers) {
        return rejection;
    }

    let mut state = state.lock();
    state.next_upload_id += 1;
    let upload_id = format!("fake-upload-{}", state.next_upload_id);
    state.uploads.insert(
        upload_id.clone(),
        Upload {
            object_name: request.file_name.clone(),
            ..Default::default()
        },
    );

    success(json!({ "uploadId": upload_id, "objectName": request.file_name }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartUrlRequest {
    upload_id: String,
    part_number: u32,
}

async fn get_part_url(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<PartUrlRequest>,
) -> Json<Value> {
    if let Some(rejection) = state.api_request("dataset/get-part-url", &headers) {
        return rejection;
    }

    let state = state.lock();
    if !state.uploads.contains_key(&request.upload_id) {
        return failure(404, "no such upload");
    }

    let Some(origin) = &state.origin else {
        return failure(500, "server not started");
    };

    let url = origin
        .join(&format!(
            "objstore/{}/{}?X-Signature=fake",
            request.upload_id, request.part_number
        ))
        .unwrap();

    success(json!({ "url": url.as_str() }))
}

async fn put_part(
    State(state): State<SharedState>,
    Path((upload_id, part_number)): Path<(String, u32)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut state = state.lock();
    state.part_requests.push(PartRequest {
        upload_id: upload_id.clone(),
        part_number,
        len: body.len(),
        authorization: authorization(&headers),
        auth_token: auth_token(&headers),
    });

    let omit_etag = state.omit_etag;
    let Some(upload) = state.uploads.get_mut(&upload_id) else {
        return (StatusCode::NOT_FOUND, "NoSuchUpload").into_response();
    };

    let etag = etag_of(&body);
    upload.parts.insert(part_number, (etag.clone(), body));

    if omit_etag {
        StatusCode::OK.into_response()
    } else {
        (StatusCode::OK, [(header::ETAG, etag)]).into_response()
    }
}

#[derive(Deserialize)]
struct CompletedPartRequest {
    #[serde(rename = "ETag")]
    etag: String,

    #[serde(rename = "PartNumber")]
    part_number: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompleteRequest {
    upload_id: String,
    parts: Vec<CompletedPartRequest>,
}

async fn complete_multipart(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<CompleteRequest>,
) -> Json<Value> {
    if let Some(rejection) = state.api_request("dataset/complete-multipart", &headers) {
        return rejection;
    }

    let mut state = state.lock();
    let Some(upload) = state.uploads.remove(&request.upload_id) else {
        return failure(404, "no such upload");
    };

    let mut object = Vec::new();
    let mut previous = 0;
    for part in &request.parts {
        match upload.parts.get(&part.part_number) {
            Some((etag, data)) if *etag == part.etag && part.part_number > previous => {
                object.extend_from_slice(data);
                previous = part.part_number;
            }
            _ => return failure(400, format!("invalid part {}", part.part_number)),
        }
    }

    let stored_name = format!("{STORED_OBJECT_PREFIX}{}", upload.object_name);
    state.objects.insert(stored_name.clone(), Bytes::from(object));

    success(json!({ "objectName": stored_name, "message": "upload completed" }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AbortRequest {
    upload_id: String,
}

async fn abort_multipart(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<AbortRequest>,
) -> Json<Value> {
    if let Some(rejection) = state.api_request("dataset/abort-multipart", &headers) {
        return rejection;
    }

    let mut state = state.lock();
    state.uploads.remove(&request.upload_id);
    state.aborted.push(request.upload_id.clone());

    success(json!({ "message": format!("upload {} aborted", request.upload_id) }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteRequest {
    dataset_id: u64,
    object_name: String,
}

async fn delete_dataset(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<DeleteRequest>,
) -> Json<Value> {
    if let Some(rejection) = state.api_request("dataset/delete-dataset", &headers) {
        return rejection;
    }

    let mut state = state.lock();
    state.objects.remove(&request.object_name);
    state
        .deleted
        .push((request.dataset_id, request.object_name));

    // Deletions answer 204 with no data
    Json(json!({ "code": 204, "msg": "deleted" }))
}

#[derive(Deserialize)]
struct DownloadPaidQuery {
    #[serde(rename = "datasetID")]
    dataset_id: u64,
}

async fn download_paid(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<DownloadPaidQuery>,
) -> Json<Value> {
    if let Some(rejection) = state.api_request("dataset/download-paid", &headers) {
        return rejection;
    }

    success(json!({ "objectName": format!("paid/{}.zip", query.dataset_id) }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadStatusQuery {
    #[serde(rename = "datasetID")]
    dataset_id: u64,
    object_name: String,
}

async fn download_status(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<DownloadStatusQuery>,
) -> Json<Value> {
    if let Some(rejection) = state.api_request("dataset/download-status", &headers) {
        return rejection;
    }

    let mut state = state.lock();
    state.download_polls += 1;

    let step = if state.download_script.len() > 1 {
        state.download_script.pop_front()
    } else {
        state.download_script.front().cloned()
    };

    let Some(step) = step else {
        return failure(404, format!("no download task for dataset {}", query.dataset_id));
    };

    let url = match (&state.origin, step.ready) {
        (Some(origin), true) => origin
            .join(&format!("files/{}", query.object_name))
            .map(|url| url.to_string())
            .unwrap_or_default(),
        _ => String::new(),
    };

    success(json!({ "url": url, "progress": step.progress, "status": step.status }))
}

async fn get_file(Path(object_name): Path<String>) -> String {
    format!("contents of {object_name}")
}

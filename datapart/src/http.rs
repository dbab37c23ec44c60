//! Implementation of the backend interfaces over HTTP.
//!
//! The marketplace REST API wraps every response in an envelope of the form
//! `{ "code": 200, "msg": "success", "data": { ... } }`, and always answers with HTTP 200 even
//! when the request failed; the envelope's `code` carries the real outcome.  Part bytes don't go
//! through the REST API at all, they're PUT directly to the pre-signed object storage URLs the
//! API hands out.
use crate::api::{
    AbortUploadResponse, CompleteUploadResponse, CompletedPart, DownloadTaskApi,
    DownloadTaskState, DownloadTaskStatus, InitUploadResponse, PartTransport, UploadApi,
};
use crate::{Config, Result};
use bytes::Bytes;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, instrument};
use url::Url;

/// Part bodies are streamed in slices of this size, each one producing a progress update
const PROGRESS_SLICE_SIZE: usize = 64 * 1024;

/// Name of the cookie carrying [`Config::auth_token`]
pub const AUTH_COOKIE_NAME: &str = "auth_token";

/// Client for the marketplace REST API and for pre-signed object storage URLs.
///
/// Implements [`UploadApi`], [`PartTransport`] and [`DownloadTaskApi`].  Cloning is cheap; all
/// clones share one connection pool.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<HttpClientInner>,
}

struct HttpClientInner {
    base_url: Url,
    auth_token: Option<String>,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct Envelope<T> {
    code: u32,

    #[serde(default)]
    msg: String,

    data: Option<T>,
}

#[derive(Deserialize)]
struct PartUrlData {
    url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadTaskData {
    object_name: String,
}

#[derive(Deserialize)]
struct DownloadStatusData {
    #[serde(default)]
    url: Option<String>,

    #[serde(default)]
    progress: Option<NumberOrText>,

    #[serde(default)]
    status: Option<u8>,
}

/// The backend reports download progress as either a number or a numeric string
#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(f64),
    Text(String),
}

impl NumberOrText {
    fn as_percent(&self) -> u8 {
        let value = match self {
            Self::Number(number) => *number,
            Self::Text(text) => text.trim().parse::<f64>().unwrap_or(0.0),
        };

        value.clamp(0.0, 100.0) as u8
    }
}

impl HttpClient {
    /// Build a client from the API base URL and auth token in `config`
    pub fn new(config: &Config) -> Result<Self> {
        let base_url = config
            .api_base_url
            .clone()
            .context(crate::error::MissingApiBaseUrlSnafu)?;

        Ok(Self::with_client(
            base_url,
            config.auth_token.clone(),
            reqwest::Client::new(),
        ))
    }

    /// Build a client around an existing `reqwest` client
    pub fn with_client(
        mut base_url: Url,
        auth_token: Option<String>,
        client: reqwest::Client,
    ) -> Self {
        // Endpoints are joined onto the base as relative paths, which replaces the last path
        // segment unless the base ends with `/`
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Self {
            inner: Arc::new(HttpClientInner {
                base_url,
                auth_token,
                client,
            }),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    fn endpoint_url(&self, endpoint: &str) -> Result<Url> {
        self.inner
            .base_url
            .join(endpoint)
            .with_context(|_| crate::error::InvalidApiUrlSnafu {
                base: self.inner.base_url.clone(),
                endpoint,
            })
    }

    /// The backend authenticates REST calls with the session cookie its login sets, and looks at
    /// nothing else
    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.inner.auth_token {
            Some(token) => request.header(
                reqwest::header::COOKIE,
                format!("{AUTH_COOKIE_NAME}={token}"),
            ),
            None => request,
        }
    }

    async fn post<B, T>(&self, endpoint: &str, body: &B) -> Result<Option<T>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.endpoint_url(endpoint)?;
        let request = self.authorize(self.inner.client.post(url).json(body));

        self.send_envelope(endpoint, request).await
    }

    async fn get<T>(&self, endpoint: &str, query: &[(&str, String)]) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let url = self.endpoint_url(endpoint)?;
        let request = self.authorize(self.inner.client.get(url).query(query));

        self.send_envelope(endpoint, request).await
    }

    /// Send a request and unwrap the response envelope, returning its `data` if any
    async fn send_envelope<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<Option<T>> {
        let response = request
            .send()
            .await
            .with_context(|_| crate::error::ApiRequestSnafu { endpoint })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return crate::error::ApiHttpStatusSnafu {
                endpoint,
                status,
                body,
            }
            .fail();
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .with_context(|_| crate::error::ApiRequestSnafu { endpoint })?;

        // The backend uses 200 for most successes but e.g. 204 for deletions
        ensure!(
            (200..300).contains(&envelope.code),
            crate::error::ApiRejectedSnafu {
                endpoint,
                code: envelope.code,
                msg: envelope.msg,
            }
        );

        Ok(envelope.data)
    }

    /// Like [`Self::post`] but fails if the envelope has no data
    async fn post_expecting<B, T>(&self, endpoint: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.post(endpoint, body)
            .await?
            .context(crate::error::ApiResponseMissingDataSnafu { endpoint })
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("base_url", &self.inner.base_url.as_str())
            .field("authenticated", &self.inner.auth_token.is_some())
            .finish()
    }
}

#[async_trait::async_trait]
impl UploadApi for HttpClient {
    #[instrument(skip(self))]
    async fn init_upload(&self, object_name: &str) -> Result<InitUploadResponse> {
        self.post_expecting(
            "dataset/init-multipart",
            &serde_json::json!({ "fileName": object_name }),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn get_part_upload_url(
        &self,
        object_name: &str,
        upload_id: &str,
        part_number: u32,
    ) -> Result<Url> {
        let data: PartUrlData = self
            .post_expecting(
                "dataset/get-part-url",
                &serde_json::json!({
                    "objectName": object_name,
                    "uploadId": upload_id,
                    "partNumber": part_number,
                }),
            )
            .await?;

        data.url
            .parse()
            .with_context(|_| crate::error::InvalidPartUrlSnafu {
                part_number,
                url: data.url.clone(),
            })
    }

    #[instrument(skip(self, parts), fields(parts = parts.len()))]
    async fn complete_upload(
        &self,
        object_name: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<CompleteUploadResponse> {
        self.post_expecting(
            "dataset/complete-multipart",
            &serde_json::json!({
                "objectName": object_name,
                "uploadId": upload_id,
                "parts": parts,
            }),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn abort_upload(
        &self,
        object_name: &str,
        upload_id: &str,
    ) -> Result<AbortUploadResponse> {
        let response: Option<AbortUploadResponse> = self
            .post(
                "dataset/abort-multipart",
                &serde_json::json!({ "objectName": object_name, "uploadId": upload_id }),
            )
            .await?;

        Ok(response.unwrap_or(AbortUploadResponse {
            message: String::new(),
        }))
    }

    #[instrument(skip(self))]
    async fn delete_dataset_and_file(&self, dataset_id: u64, object_name: &str) -> Result<()> {
        let _: Option<serde_json::Value> = self
            .post(
                "dataset/delete-dataset",
                &serde_json::json!({ "datasetId": dataset_id, "objectName": object_name }),
            )
            .await?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl PartTransport for HttpClient {
    #[instrument(skip(self, data, progress), fields(host = url.host_str().unwrap_or_default(), size = data.len()))]
    async fn put_part(
        &self,
        url: Url,
        data: Bytes,
        progress: mpsc::UnboundedSender<u64>,
    ) -> Result<String> {
        let host = url.host_str().unwrap_or_default().to_string();
        let len = data.len();

        // Stream the part in slices so progress can be reported as the body is consumed.
        // `Bytes::slice` doesn't copy.
        let slices = (0..len).step_by(PROGRESS_SLICE_SIZE).map(move |start| {
            let end = (start + PROGRESS_SLICE_SIZE).min(len);
            (data.slice(start..end), end as u64)
        });
        let body = futures::stream::iter(slices).map(move |(slice, sent)| {
            let _ = progress.send(sent);
            Ok::<_, std::io::Error>(slice)
        });

        // Pre-signed URLs don't get the auth cookie; the signature is the authorization.
        // Object storage also rejects chunked uploads, so the length must be explicit.
        let response = self
            .inner
            .client
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(reqwest::header::CONTENT_LENGTH, len)
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await
            .with_context(|_| crate::error::PartUploadSnafu { host: host.clone() })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return crate::error::PartUploadRejectedSnafu { host, status, body }.fail();
        }

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string())
            .context(crate::error::MissingEtagSnafu { host })?;

        debug!(%etag, "Part accepted by object storage");

        Ok(etag)
    }
}

#[async_trait::async_trait]
impl DownloadTaskApi for HttpClient {
    #[instrument(skip(self))]
    async fn start_download_task(&self, dataset_id: u64) -> Result<String> {
        let endpoint = "dataset/download-paid";
        let data: DownloadTaskData = self
            .get(endpoint, &[("datasetID", dataset_id.to_string())])
            .await?
            .context(crate::error::ApiResponseMissingDataSnafu { endpoint })?;

        Ok(data.object_name)
    }

    #[instrument(skip(self))]
    async fn download_task_status(
        &self,
        dataset_id: u64,
        object_name: &str,
    ) -> Result<DownloadTaskStatus> {
        let endpoint = "dataset/download-status";
        let data: DownloadStatusData = self
            .get(
                endpoint,
                &[
                    ("datasetID", dataset_id.to_string()),
                    ("objectName", object_name.to_string()),
                ],
            )
            .await?
            .context(crate::error::ApiResponseMissingDataSnafu { endpoint })?;

        let progress = data
            .progress
            .as_ref()
            .map(NumberOrText::as_percent)
            .unwrap_or(0);

        // An empty or unparseable URL means there's nothing to download from yet
        let url = data
            .url
            .filter(|url| !url.is_empty())
            .and_then(|url| url.parse::<Url>().ok());

        let state = if data.status == Some(1) || progress >= 100 {
            DownloadTaskState::Ready
        } else {
            DownloadTaskState::Preparing
        };

        Ok(DownloadTaskStatus {
            url,
            progress,
            state,
        })
    }
}

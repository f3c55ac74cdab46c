//! Single upload attempts.
//!
//! Success requires more than a 2xx status: the endpoint reports rejected
//! files inside an `Errors` array in the JSON body, so every response body is
//! inspected before an attempt counts as uploaded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{multipart, Client, StatusCode, Url};
use serde::Deserialize;

use crate::Result;

/// Form field carrying the file bytes.
pub const FILE_FIELD: &str = "Files";

/// Response bodies are truncated to this many bytes in errors and logs.
const MAX_BODY_IN_ERROR: usize = 512;

// --- ERROR HANDLING ---

/// Why one upload attempt failed. Every variant is retryable.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("unexpected HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("upload rejected: {}", errors.join("; "))]
    Rejected { errors: Vec<String> },

    #[error("malformed response ({reason}): {body}")]
    MalformedResponse { reason: String, body: String },
}

impl UploadError {
    pub fn is_application_level(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::MalformedResponse { .. })
    }
}

/// The upload backend capability. One call is one attempt; retries live in
/// [`crate::RetryPolicy`].
pub trait Uploader: Send + Sync {
    fn upload<'a>(
        &'a self,
        path: &'a Path,
        query: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, std::result::Result<(), UploadError>>;
}

// --- RESPONSE INSPECTION ---

#[derive(Deserialize, Debug)]
struct UploadResponse {
    #[serde(rename = "Errors")]
    errors: Vec<serde_json::Value>,
    // Allow unknown fields from the endpoint
    #[serde(flatten)]
    #[serde(default)]
    #[allow(dead_code)]
    extra: std::collections::HashMap<String, serde_json::Value>,
}

/// Classifies a response from its status and body.
pub fn inspect_response(status: StatusCode, body: &str) -> std::result::Result<(), UploadError> {
    if !status.is_success() {
        return Err(UploadError::Status {
            status: status.as_u16(),
            body: truncate(body),
        });
    }

    let parsed: UploadResponse =
        serde_json::from_str(body).map_err(|e| UploadError::MalformedResponse {
            reason: e.to_string(),
            body: truncate(body),
        })?;

    if parsed.errors.is_empty() {
        Ok(())
    } else {
        Err(UploadError::Rejected {
            errors: parsed
                .errors
                .into_iter()
                .map(|v| match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                })
                .collect(),
        })
    }
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_BODY_IN_ERROR {
        return body.to_string();
    }
    let mut end = MAX_BODY_IN_ERROR;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

// --- THE CLIENT ---

/// Uploads files to a real HTTP endpoint as multipart form posts.
#[derive(Clone)]
pub struct HttpUploader {
    client: Client,
    url: Url,
    token: String,
}

impl HttpUploader {
    pub fn new(url: Url, token: impl Into<String>, workers: usize) -> Result<Self> {
        Self::with_timeout(url, token, workers, None)
    }

    pub fn with_timeout(
        url: Url,
        token: impl Into<String>,
        workers: usize,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let mut builder = Client::builder()
            .pool_max_idle_per_host(workers)
            .pool_idle_timeout(Some(Duration::from_secs(90)));
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
            url,
            token: token.into(),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn upload_streaming(
        &self,
        local_file: &Path,
        query: &BTreeMap<String, String>,
    ) -> std::result::Result<(), UploadError> {
        let io_err = |source: std::io::Error| UploadError::Io {
            path: local_file.to_path_buf(),
            source,
        };

        let filename = local_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());

        // Stream the file instead of buffering it into the form
        let file = tokio::fs::File::open(local_file).await.map_err(io_err)?;
        let file_size = file.metadata().await.map_err(io_err)?.len();

        let stream = tokio_util::io::ReaderStream::new(file);
        let body = reqwest::Body::wrap_stream(stream);

        let part = multipart::Part::stream_with_length(body, file_size)
            .file_name(filename)
            .mime_str("application/octet-stream")?;

        let form = multipart::Form::new().part(FILE_FIELD, part);

        let response = self
            .client
            .post(self.url.clone())
            .query(query)
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        tracing::trace!(status = status.as_u16(), body = %truncate(&text), "upload response");

        inspect_response(status, &text)
    }
}

impl Uploader for HttpUploader {
    fn upload<'a>(
        &'a self,
        path: &'a Path,
        query: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, std::result::Result<(), UploadError>> {
        Box::pin(self.upload_streaming(path, query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_errors_is_success() {
        assert!(inspect_response(StatusCode::OK, r#"{"Response":true,"Errors":[]}"#).is_ok());
    }

    #[test]
    fn populated_errors_is_rejection() {
        let err = inspect_response(StatusCode::OK, r#"{"Errors":["bad", {"code":7}]}"#).unwrap_err();
        match err {
            UploadError::Rejected { errors } => {
                assert_eq!(errors, vec!["bad".to_string(), r#"{"code":7}"#.to_string()]);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn missing_or_garbled_errors_field_is_malformed() {
        for body in ["{}", "not json", r#"{"Errors":"nope"}"#, "[]", ""] {
            let err = inspect_response(StatusCode::OK, body).unwrap_err();
            assert!(
                matches!(err, UploadError::MalformedResponse { .. }),
                "{body:?} gave {err:?}"
            );
            assert!(err.is_application_level());
        }
    }

    #[test]
    fn non_success_status_fails_even_with_clean_body() {
        assert!(inspect_response(StatusCode::CREATED, r#"{"Errors":[]}"#).is_ok());

        let err = inspect_response(StatusCode::INTERNAL_SERVER_ERROR, r#"{"Errors":[]}"#).unwrap_err();
        assert!(matches!(err, UploadError::Status { status: 500, .. }));
        assert!(!err.is_application_level());
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "é".repeat(600);
        let err = inspect_response(StatusCode::BAD_GATEWAY, &body).unwrap_err();
        let UploadError::Status { body, .. } = err else {
            panic!("expected status error");
        };
        assert!(body.ends_with("..."));
        assert!(body.len() <= MAX_BODY_IN_ERROR + 3);
    }
}

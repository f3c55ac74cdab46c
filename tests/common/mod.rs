//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use mass_relay::sim_server::{read_request, write_response, RequestHead};
use mass_relay::{Task, TaskKey, UploadError, Uploader};
use reqwest::Url;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub const ACCEPTED: (u16, &str) = (200, r#"{"Response":true,"Errors":[]}"#);

/// Loopback endpoint answering requests from a fixed script. Once the script
/// runs out, the last entry is repeated.
pub struct MockEndpoint {
    pub url: Url,
    requests: Arc<Mutex<Vec<RequestHead>>>,
    stop: CancellationToken,
}

impl MockEndpoint {
    pub async fn start(script: Vec<(u16, &'static str)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("http://{}/", listener.local_addr().unwrap())).unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let stop = CancellationToken::new();

        let seen = requests.clone();
        let token = stop.clone();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(conn) => conn,
                        Err(_) => break,
                    },
                };
                let Ok(Some(head)) = read_request(&mut stream).await else {
                    continue;
                };
                let index = {
                    let mut seen = seen.lock().unwrap();
                    seen.push(head);
                    seen.len() - 1
                };
                let (status, body) = script
                    .get(index)
                    .or(script.last())
                    .copied()
                    .unwrap_or(ACCEPTED);
                let _ = write_response(&mut stream, status, body).await;
            }
        });

        Self { url, requests, stop }
    }

    pub fn hits(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<RequestHead> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for MockEndpoint {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// In-memory uploader with per-file failure counts and concurrency tracking.
pub struct ScriptedUploader {
    delay: Duration,
    failures: Mutex<HashMap<PathBuf, u32>>,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedUploader {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            failures: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// The next `times` attempts for `path` fail.
    pub fn failing(self, path: impl Into<PathBuf>, times: u32) -> Self {
        self.failures.lock().unwrap().insert(path.into(), times);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl Uploader for ScriptedUploader {
    fn upload<'a>(
        &'a self,
        path: &'a Path,
        _query: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, Result<(), UploadError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);

            if self.delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.delay).await;
            }

            let fail = match self.failures.lock().unwrap().get_mut(path) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            };
            self.active.fetch_sub(1, Ordering::SeqCst);

            if fail {
                Err(UploadError::Status {
                    status: 500,
                    body: String::new(),
                })
            } else {
                Ok(())
            }
        })
    }
}

pub fn batch(count: usize, size: u64) -> Vec<Task> {
    (0..count)
        .map(|i| Task::new(TaskKey::new(format!("/batch/file-{i}.bin")), size))
        .collect()
}

//! Catalog HTTP protocol.
//!
//! Every request carries the cached bearer token. A 401 invalidates the
//! token, fetches a fresh one and repeats the request once. Network errors
//! and 5xx answers are retried up to `max_attempts` with a fixed delay.

use crate::credentials::CredentialProvider;
use reqwest::StatusCode;
use scingest_core::{AuthError, DatasetId, IngestorConfig, SubmissionError};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of a request together with the number of attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, SubmissionError>,
    pub attempts: u32,
}

impl<T> Attempted<T> {
    fn map<U>(self, f: impl FnOnce(T) -> U) -> Attempted<U> {
        Attempted {
            result: self.result.map(f),
            attempts: self.attempts,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum CatalogOp<'a> {
    Exists(&'a DatasetId),
    CreateDataset(&'a DatasetId, &'a Value),
    PatchDataset(&'a DatasetId, &'a Value),
    CreateDatablock(&'a DatasetId, &'a Value),
}

impl CatalogOp<'_> {
    fn dataset(&self) -> &DatasetId {
        match self {
            CatalogOp::Exists(id)
            | CatalogOp::CreateDataset(id, _)
            | CatalogOp::PatchDataset(id, _)
            | CatalogOp::CreateDatablock(id, _) => id,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            CatalogOp::Exists(_) => "existence check",
            CatalogOp::CreateDataset(..) => "create",
            CatalogOp::PatchDataset(..) => "patch",
            CatalogOp::CreateDatablock(..) => "datablock create",
        }
    }
}

fn classify(status: StatusCode, body: String, op: &CatalogOp<'_>) -> SubmissionError {
    let code = status.as_u16();
    match code {
        401 => SubmissionError::Unauthorized { status: code, body },
        404 => SubmissionError::NotFound(op.dataset().to_string()),
        409 => SubmissionError::AlreadyExists(op.dataset().to_string()),
        500..=599 => SubmissionError::Server { status: code, body },
        _ => SubmissionError::Rejected { status: code, body },
    }
}

/// Some catalog versions answer a lookup of a missing dataset with 200 and
/// an empty document.
fn is_empty_document(body: &str) -> bool {
    matches!(body.trim(), "" | "null" | "{}" | "[]")
}

pub struct CatalogClient {
    client: reqwest::Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
    token: RwLock<Option<String>>,
    /// Held while logging in, so only one caller talks to the login endpoint
    login: Mutex<()>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl CatalogClient {
    pub fn new(
        config: &IngestorConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, SubmissionError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SubmissionError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.scicat_url.trim_end_matches('/').to_string(),
            credentials,
            token: RwLock::new(None),
            login: Mutex::new(()),
            max_attempts: config.max_attempts.max(1),
            retry_delay: config.retry_delay(),
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub async fn dataset_exists(
        &self,
        id: &DatasetId,
        cancel: &CancellationToken,
    ) -> Attempted<bool> {
        let attempted = self.submit_with_retry(CatalogOp::Exists(id), cancel).await;
        match attempted.result {
            Ok(body) => Attempted {
                result: Ok(!is_empty_document(&body)),
                attempts: attempted.attempts,
            },
            Err(SubmissionError::NotFound(_)) => Attempted {
                result: Ok(false),
                attempts: attempted.attempts,
            },
            Err(e) => Attempted {
                result: Err(e),
                attempts: attempted.attempts,
            },
        }
    }

    pub async fn create_dataset(
        &self,
        id: &DatasetId,
        body: &Value,
        cancel: &CancellationToken,
    ) -> Attempted<()> {
        self.submit_with_retry(CatalogOp::CreateDataset(id, body), cancel)
            .await
            .map(|_| ())
    }

    pub async fn patch_dataset(
        &self,
        id: &DatasetId,
        body: &Value,
        cancel: &CancellationToken,
    ) -> Attempted<()> {
        self.submit_with_retry(CatalogOp::PatchDataset(id, body), cancel)
            .await
            .map(|_| ())
    }

    pub async fn create_datablock(
        &self,
        id: &DatasetId,
        body: &Value,
        cancel: &CancellationToken,
    ) -> Attempted<()> {
        self.submit_with_retry(CatalogOp::CreateDatablock(id, body), cancel)
            .await
            .map(|_| ())
    }

    /// Runs `op`, retrying transient failures. No new attempt starts once
    /// `cancel` fired; an attempt already in flight is allowed to finish.
    async fn submit_with_retry(
        &self,
        op: CatalogOp<'_>,
        cancel: &CancellationToken,
    ) -> Attempted<String> {
        let mut attempts = 0;
        loop {
            if cancel.is_cancelled() {
                return Attempted {
                    result: Err(SubmissionError::Cancelled),
                    attempts,
                };
            }
            attempts += 1;

            match self.with_auth(&op).await {
                Ok(body) => {
                    return Attempted {
                        result: Ok(body),
                        attempts,
                    }
                }
                Err(e) if e.is_retryable() && attempts < self.max_attempts => {
                    warn!(
                        "Catalog {} of {} failed (attempt {}/{}): {}",
                        op.name(),
                        op.dataset(),
                        attempts,
                        self.max_attempts,
                        e
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Attempted {
                                result: Err(SubmissionError::Cancelled),
                                attempts,
                            };
                        }
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                }
                Err(e) => return Attempted { result: Err(e), attempts },
            }
        }
    }

    async fn with_auth(&self, op: &CatalogOp<'_>) -> Result<String, SubmissionError> {
        let token = self.token().await?;
        match self.send(op, &token).await {
            Err(SubmissionError::Unauthorized { .. }) => {
                info!("Catalog token rejected, refreshing");
                self.invalidate_token(&token).await;
                let token = self.token().await?;
                self.send(op, &token).await
            }
            other => other,
        }
    }

    /// Returns the cached token, logging in when there is none. Callers
    /// holding a valid token never wait on a login in progress.
    async fn token(&self) -> Result<String, AuthError> {
        if let Some(token) = self.token.read().await.as_ref() {
            return Ok(token.clone());
        }

        let _login = self.login.lock().await;
        // someone else may have logged in while we waited
        if let Some(token) = self.token.read().await.as_ref() {
            return Ok(token.clone());
        }
        let token = self.credentials.get_token().await?;
        *self.token.write().await = Some(token.clone());
        Ok(token)
    }

    /// Drops `rejected` from the cache. A token another caller already
    /// refreshed is kept.
    pub async fn invalidate_token(&self, rejected: &str) {
        let mut cached = self.token.write().await;
        if cached.as_deref() == Some(rejected) {
            *cached = None;
        }
    }

    fn dataset_url(&self, id: &DatasetId) -> String {
        format!(
            "{}/datasets/{}",
            self.base_url,
            urlencoding::encode(id.as_str())
        )
    }

    async fn send(&self, op: &CatalogOp<'_>, token: &str) -> Result<String, SubmissionError> {
        let request = match op {
            CatalogOp::Exists(id) => self.client.get(self.dataset_url(id)),
            CatalogOp::CreateDataset(_, body) => self
                .client
                .post(format!("{}/datasets", self.base_url))
                .json(body),
            CatalogOp::PatchDataset(id, body) => self.client.patch(self.dataset_url(id)).json(body),
            CatalogOp::CreateDatablock(_, body) => self
                .client
                .post(format!("{}/origdatablocks", self.base_url))
                .json(body),
        };
        debug!(">>> Catalog {} {}", op.name(), op.dataset());

        let resp = request
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| SubmissionError::Transport(e.to_string()))?;

        let status = resp.status();
        let body = match resp.text().await {
            Ok(body) => body,
            // A cut-off success body says nothing about the dataset.
            Err(e) if status.is_success() => {
                return Err(SubmissionError::Transport(format!(
                    "reading {} response: {}",
                    op.name(),
                    e
                )))
            }
            Err(_) => String::new(),
        };
        debug!("<<< Catalog {} {}: {}", op.name(), op.dataset(), status);
        if status.is_success() {
            Ok(body)
        } else {
            Err(classify(status, body, op))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticTokenProvider;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wiremock::matchers::{header, method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Hands out tok-1, tok-2, ... on successive calls.
    struct CountingProvider {
        issued: AtomicU32,
    }

    #[async_trait]
    impl CredentialProvider for CountingProvider {
        async fn get_token(&self) -> Result<String, AuthError> {
            let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("tok-{}", n))
        }
    }

    /// Like [`CountingProvider`], but every login takes a while.
    struct SlowProvider {
        issued: AtomicU32,
    }

    #[async_trait]
    impl CredentialProvider for SlowProvider {
        async fn get_token(&self) -> Result<String, AuthError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("tok-{}", n))
        }
    }

    fn client(server: &MockServer, credentials: Arc<dyn CredentialProvider>) -> CatalogClient {
        client_for(server.uri(), credentials)
    }

    fn client_for(url: String, credentials: Arc<dyn CredentialProvider>) -> CatalogClient {
        let config = IngestorConfig {
            scicat_url: url,
            max_attempts: 3,
            retry_delay_ms: 1,
            ..Default::default()
        };
        CatalogClient::new(&config, credentials).unwrap()
    }

    fn id() -> DatasetId {
        DatasetId::new("99001234", "scan_1")
    }

    #[tokio::test]
    async fn test_existence_check() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/datasets/99001234%2Fscan_1"))
            .and(header("Authorization", "Bearer static"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"pid": "99001234/scan_1"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/datasets/99001234%2Fscan_2"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/datasets/99001234%2Fscan_3"))
            .respond_with(ResponseTemplate::new(200).set_body_string("null"))
            .mount(&server)
            .await;

        let catalog = client(&server, Arc::new(StaticTokenProvider::new("static")));
        let cancel = CancellationToken::new();

        let present = catalog.dataset_exists(&id(), &cancel).await;
        assert!(present.result.unwrap());
        assert_eq!(present.attempts, 1);

        let absent = catalog
            .dataset_exists(&DatasetId::new("99001234", "scan_2"), &cancel)
            .await;
        assert!(!absent.result.unwrap());

        let empty = catalog
            .dataset_exists(&DatasetId::new("99001234", "scan_3"), &cancel)
            .await;
        assert!(!empty.result.unwrap());
    }

    #[tokio::test]
    async fn test_unauthorized_refreshes_token_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/datasets"))
            .and(header("Authorization", "Bearer tok-1"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/datasets"))
            .and(header("Authorization", "Bearer tok-2"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let catalog = client(
            &server,
            Arc::new(CountingProvider {
                issued: AtomicU32::new(0),
            }),
        );
        let attempted = catalog
            .create_dataset(&id(), &json!({"pid": "99001234/scan_1"}), &CancellationToken::new())
            .await;
        assert!(attempted.result.is_ok());
        assert_eq!(attempted.attempts, 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_login() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("Authorization", "Bearer tok-1"))
            .respond_with(ResponseTemplate::new(404))
            .expect(5)
            .mount(&server)
            .await;

        let provider = Arc::new(SlowProvider {
            issued: AtomicU32::new(0),
        });
        let catalog = client(&server, provider.clone());
        let cancel = CancellationToken::new();
        let ids: Vec<DatasetId> = (0..5)
            .map(|n| DatasetId::new("99001234", &format!("scan_{}", n)))
            .collect();

        let results =
            futures::future::join_all(ids.iter().map(|id| catalog.dataset_exists(id, &cancel))).await;
        assert!(results.iter().all(|r| matches!(r.result, Ok(false))));
        assert_eq!(provider.issued.load(Ordering::SeqCst), 1);

        // a stale rejection does not throw away the current token
        catalog.invalidate_token("tok-0").await;
        assert_eq!(catalog.token().await.unwrap(), "tok-1");
        catalog.invalidate_token("tok-1").await;
        assert_eq!(catalog.token().await.unwrap(), "tok-2");
    }

    #[tokio::test]
    async fn test_second_unauthorized_is_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;

        let catalog = client(
            &server,
            Arc::new(CountingProvider {
                issued: AtomicU32::new(0),
            }),
        );
        let attempted = catalog
            .patch_dataset(&id(), &json!({}), &CancellationToken::new())
            .await;
        assert!(matches!(
            attempted.result,
            Err(SubmissionError::Unauthorized { .. })
        ));
        assert_eq!(attempted.attempts, 1);
    }

    #[tokio::test]
    async fn test_server_errors_are_retried_up_to_cap() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/origdatablocks"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .expect(3)
            .mount(&server)
            .await;

        let catalog = client(&server, Arc::new(StaticTokenProvider::new("static")));
        let attempted = catalog
            .create_datablock(&id(), &json!({}), &CancellationToken::new())
            .await;
        assert!(matches!(
            attempted.result,
            Err(SubmissionError::Server { status: 503, .. })
        ));
        assert_eq!(attempted.attempts, 3);
    }

    #[tokio::test]
    async fn test_conflicts_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/datasets"))
            .respond_with(ResponseTemplate::new(409))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path_regex("^/datasets/.+$"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad field"))
            .expect(1)
            .mount(&server)
            .await;

        let catalog = client(&server, Arc::new(StaticTokenProvider::new("static")));
        let cancel = CancellationToken::new();

        let created = catalog.create_dataset(&id(), &json!({}), &cancel).await;
        assert!(matches!(created.result, Err(SubmissionError::AlreadyExists(_))));

        let patched = catalog.patch_dataset(&id(), &json!({}), &cancel).await;
        assert!(matches!(
            patched.result,
            Err(SubmissionError::Rejected { status: 400, .. })
        ));
        assert_eq!(patched.attempts, 1);
    }

    /// Answers every request with a 200 whose body ends before its
    /// announced length.
    async fn truncating_server() -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut request = [0u8; 4096];
                let _ = stream.read(&mut request).await;
                let _ = stream
                    .write_all(
                        b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 64\r\n\r\n{\"pid\":",
                    )
                    .await;
                let _ = stream.shutdown().await;
            }
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_truncated_body_is_not_an_absent_dataset() {
        let catalog = client_for(
            truncating_server().await,
            Arc::new(StaticTokenProvider::new("static")),
        );

        let attempted = catalog
            .dataset_exists(&id(), &CancellationToken::new())
            .await;
        assert!(matches!(attempted.result, Err(SubmissionError::Transport(_))));
        assert_eq!(attempted.attempts, 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;

        let catalog = client(&server, Arc::new(StaticTokenProvider::new("static")));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let attempted = catalog.create_dataset(&id(), &json!({}), &cancel).await;
        assert!(matches!(attempted.result, Err(SubmissionError::Cancelled)));
        assert_eq!(attempted.attempts, 0);
    }

    #[test]
    fn test_classify() {
        let id = id();
        let op = CatalogOp::Exists(&id);
        assert!(classify(StatusCode::BAD_GATEWAY, String::new(), &op).is_retryable());
        assert!(!classify(StatusCode::CONFLICT, String::new(), &op).is_retryable());
        assert!(matches!(
            classify(StatusCode::NOT_FOUND, String::new(), &op),
            SubmissionError::NotFound(_)
        ));
    }
}

use async_trait::async_trait;
use scingest_core::{AuthError, IngestorConfig};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Supplies bearer tokens for the catalog.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_token(&self) -> Result<String, AuthError>;
}

/// A fixed, pre-issued token.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticTokenProvider {
    async fn get_token(&self) -> Result<String, AuthError> {
        Ok(self.token.clone())
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

/// Logs in as the ingestor user with the password from the credential file.
pub struct LoginCredentialProvider {
    client: reqwest::Client,
    login_url: String,
    username: String,
    credential_file: Option<PathBuf>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl LoginCredentialProvider {
    pub fn new(config: &IngestorConfig) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            login_url: format!("{}/Users/login", config.scicat_url.trim_end_matches('/')),
            username: config.ingestor_username.clone(),
            credential_file: config.ingestor_credential_file.clone(),
            max_attempts: config.auth_max_attempts.max(1),
            retry_delay: config.retry_delay(),
        })
    }

    fn read_password(&self) -> Result<String, AuthError> {
        let path = self
            .credential_file
            .as_ref()
            .ok_or(AuthError::MissingCredentials)?;
        let raw = std::fs::read_to_string(path).map_err(|e| AuthError::Credentials {
            path: path.clone(),
            message: e.to_string(),
        })?;
        Ok(raw.trim().to_string())
    }

    async fn login(&self, password: &str) -> Result<String, AuthError> {
        debug!("POST {}", self.login_url);
        let resp = self
            .client
            .post(&self.login_url)
            .json(&LoginRequest {
                username: &self.username,
                password,
            })
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::Rejected { status, body });
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| AuthError::Transport(format!("invalid login response: {}", e)))?;
        body.get("id")
            .or_else(|| body.get("access_token"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(AuthError::MissingToken)
    }
}

fn is_transient(error: &AuthError) -> bool {
    match error {
        AuthError::Transport(_) => true,
        AuthError::Rejected { status, .. } => *status >= 500,
        _ => false,
    }
}

#[async_trait]
impl CredentialProvider for LoginCredentialProvider {
    async fn get_token(&self) -> Result<String, AuthError> {
        let password = self.read_password()?;
        let mut delay = self.retry_delay;

        for attempt in 1..=self.max_attempts {
            match self.login(&password).await {
                Ok(token) => {
                    info!("Obtained catalog token for {}", self.username);
                    return Ok(token);
                }
                Err(e) if is_transient(&e) && attempt < self.max_attempts => {
                    warn!(
                        "Login attempt {}/{} failed: {}, retrying in {:?}",
                        attempt, self.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(e) if is_transient(&e) => {
                    return Err(AuthError::Exhausted {
                        attempts: attempt,
                        last: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Err(AuthError::Exhausted {
            attempts: self.max_attempts,
            last: "no attempt made".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer, credential_file: Option<PathBuf>) -> IngestorConfig {
        IngestorConfig {
            scicat_url: format!("{}/api/v3/", server.uri()),
            ingestor_credential_file: credential_file,
            retry_delay_ms: 1,
            auth_max_attempts: 3,
            ..Default::default()
        }
    }

    fn credential_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "s3cret").unwrap();
        file
    }

    #[tokio::test]
    async fn test_login_returns_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v3/Users/login"))
            .and(body_json(serde_json::json!({"username": "ingestor", "password": "s3cret"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "tok-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let file = credential_file();
        let provider =
            LoginCredentialProvider::new(&config(&server, Some(file.path().to_path_buf()))).unwrap();
        assert_eq!(provider.get_token().await.unwrap(), "tok-1");
    }

    #[tokio::test]
    async fn test_transient_failures_are_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v3/Users/login"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let file = credential_file();
        let provider =
            LoginCredentialProvider::new(&config(&server, Some(file.path().to_path_buf()))).unwrap();
        assert!(matches!(
            provider.get_token().await,
            Err(AuthError::Exhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_rejected_login_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad password"))
            .expect(1)
            .mount(&server)
            .await;

        let file = credential_file();
        let provider =
            LoginCredentialProvider::new(&config(&server, Some(file.path().to_path_buf()))).unwrap();
        assert!(matches!(
            provider.get_token().await,
            Err(AuthError::Rejected { status: 401, .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_credentials() {
        let server = MockServer::start().await;
        let provider = LoginCredentialProvider::new(&config(&server, None)).unwrap();
        assert!(matches!(
            provider.get_token().await,
            Err(AuthError::MissingCredentials)
        ));

        let provider = LoginCredentialProvider::new(&config(
            &server,
            Some(PathBuf::from("/no/such/credential")),
        ))
        .unwrap();
        assert!(matches!(
            provider.get_token().await,
            Err(AuthError::Credentials { .. })
        ));
    }
}

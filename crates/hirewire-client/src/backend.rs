//! Backend notification service: authoritative pull and read acknowledgements

use std::future::Future;
use std::time::Duration;

use reqwest::{Client, Response, StatusCode, Url};
use serde_json::Value;

use hirewire_core::{
    extract_items, ConfigError, MalformedPayload, NotificationId, NotifyError, Result, ServiceConfig,
    TransientError,
};

use crate::identity::Credentials;

/// The two REST calls the subsystem makes
pub trait NotificationBackend: Send + Sync + 'static {
    /// Fetch the full notification list for the user.
    ///
    /// Items are returned unparsed so a malformed one can be dropped without
    /// losing the rest.
    fn fetch_all(
        &self,
        credentials: &Credentials,
    ) -> impl Future<Output = Result<Vec<Value>>> + Send;

    /// Mark ids as read. Idempotent: already-read ids are not an error.
    fn acknowledge(
        &self,
        credentials: &Credentials,
        ids: &[NotificationId],
    ) -> impl Future<Output = Result<()>> + Send;
}

/// `reqwest`-based backend
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: Url,
}

impl HttpBackend {
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("hirewire/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransientError::Request(e.to_string()))?;

        let mut base_url = Url::parse(&config.base_url)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", config.base_url, e)))?;
        match base_url.path_segments_mut() {
            Ok(mut path) => {
                path.pop_if_empty();
            }
            Err(()) => {
                return Err(ConfigError::InvalidUrl(format!(
                    "{}: cannot carry a path",
                    config.base_url
                ))
                .into())
            }
        }

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// Base URL extended by `segments`, each percent-encoded as one segment
    fn route(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn list_url(&self) -> Url {
        self.route(&["notifications"])
    }

    /// Single ids use the per-entry route, larger sets the batch route
    fn ack_url(&self, ids: &[NotificationId]) -> Url {
        match ids {
            [single] => self.route(&["notifications", single.as_str(), "read"]),
            _ => self.route(&["notifications", "read"]),
        }
    }
}

impl NotificationBackend for HttpBackend {
    async fn fetch_all(&self, credentials: &Credentials) -> Result<Vec<Value>> {
        let response = self
            .client
            .get(self.list_url())
            .header(reqwest::header::AUTHORIZATION, credentials.bearer())
            .send()
            .await
            .map_err(request_error)?;

        let response = check_status(response).await?;
        let body: Value = response.json().await.map_err(|e| {
            if e.is_decode() {
                NotifyError::MalformedPayload(MalformedPayload::Frame(e.to_string()))
            } else {
                request_error(e)
            }
        })?;

        Ok(extract_items(body)?)
    }

    async fn acknowledge(&self, credentials: &Credentials, ids: &[NotificationId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut request = self
            .client
            .put(self.ack_url(ids))
            .header(reqwest::header::AUTHORIZATION, credentials.bearer());
        if ids.len() > 1 {
            request = request.json(&serde_json::json!({ "ids": ids }));
        }

        let response = request.send().await.map_err(request_error)?;
        check_status(response).await?;
        tracing::debug!("Acknowledged {} notifications", ids.len());
        Ok(())
    }
}

fn request_error(err: reqwest::Error) -> NotifyError {
    if err.is_timeout() {
        TransientError::Timeout.into()
    } else {
        TransientError::Request(err.to_string()).into()
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message: String = response
        .text()
        .await
        .unwrap_or_default()
        .chars()
        .take(200)
        .collect();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        tracing::warn!("Notification service rejected credentials ({})", status);
    }

    Err(TransientError::Http {
        status: status.as_u16(),
        message,
    }
    .into())
}

//! Outbound HTTP with error classification.
//!
//! Every network error the rest of the crate ever sees is an [`HttpError`],
//! produced here at the HTTP boundary.  Handlers never inspect reqwest
//! errors themselves; they ask `is_retryable()` / `is_not_found()`.

use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;

pub type Result<T> = std::result::Result<T, HttpError>;

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("request timed out: {url}")]
    Timeout { url: String },

    #[error("connection failed: {url}: {message}")]
    Connect { url: String, message: String },

    #[error("http status {status} for {url}")]
    Status { status: StatusCode, url: String },

    #[error("failed to decode response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl HttpError {
    /// Transient failures worth retrying: timeouts, connection resets and
    /// server-side (5xx) statuses.  Client errors are not retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            HttpError::Timeout { .. } | HttpError::Connect { .. } => true,
            HttpError::Status { status, .. } => status.is_server_error(),
            HttpError::Decode { .. } => false,
        }
    }

    /// 404s are "no data", not errors, for archive/commitfest/CI lookups.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            HttpError::Status {
                status: StatusCode::NOT_FOUND,
                ..
            }
        )
    }

    fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HttpError::Timeout {
                url: url.to_string(),
            }
        } else if err.is_decode() {
            HttpError::Decode {
                url: url.to_string(),
                message: err.to_string(),
            }
        } else {
            HttpError::Connect {
                url: url.to_string(),
                message: err.to_string(),
            }
        }
    }
}

/// HTTP client wrapper carrying the configured User-Agent, timeout, and the
/// polite inter-request sleep.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    sleep: Duration,
}

impl Fetcher {
    pub fn new(user_agent: &str, timeout: Duration, sleep: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(user_agent.to_string())
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Fetcher { client, sleep }
    }

    async fn get_response(&self, url: &str) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| HttpError::from_reqwest(url, e))?;
        if !self.sleep.is_zero() {
            tokio::time::sleep(self.sleep).await;
        }
        let status = response.status();
        if !status.is_success() {
            return Err(HttpError::Status {
                status,
                url: url.to_string(),
            });
        }
        Ok(response)
    }

    /// Fetch a text body.
    pub async fn fetch_text(&self, url: &str) -> Result<String> {
        let response = self.get_response(url).await?;
        response
            .text()
            .await
            .map_err(|e| HttpError::from_reqwest(url, e))
    }

    /// Fetch a binary body.
    pub async fn fetch_binary(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.get_response(url).await?;
        Ok(response
            .bytes()
            .await
            .map_err(|e| HttpError::from_reqwest(url, e))?
            .to_vec())
    }

    /// Fetch and deserialize a JSON body.
    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.get_response(url).await?;
        response
            .json()
            .await
            .map_err(|e| HttpError::from_reqwest(url, e))
    }

    /// POST a JSON body, returning the parsed JSON response.
    pub async fn post_json<B: serde::Serialize, T: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| HttpError::from_reqwest(url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(HttpError::Status {
                status,
                url: url.to_string(),
            });
        }
        response
            .json()
            .await
            .map_err(|e| HttpError::from_reqwest(url, e))
    }

    /// POST a JSON body, ignoring the response body.
    pub async fn post_json_no_response<B: serde::Serialize>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<()> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| HttpError::from_reqwest(url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(HttpError::Status {
                status,
                url: url.to_string(),
            });
        }
        Ok(())
    }
}

/// Decode bytes into text safe for storage: invalid UTF-8 sequences are
/// dropped, NUL codepoints removed (the database rejects them), and
/// carriage returns stripped.
pub fn binary_to_safe_utf8(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.chars()
        .filter(|c| *c != '\u{FFFD}' && *c != '\0' && *c != '\r')
        .collect()
}

/// Does an anyhow error chain bottom out in a retryable [`HttpError`]?
pub fn is_retryable_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<HttpError>()
        .is_some_and(|e| e.is_retryable())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_to_safe_utf8() {
        assert_eq!(binary_to_safe_utf8(b"hello\r\nworld\0!"), "hello\nworld!");
        // invalid UTF-8 bytes are dropped, not replaced
        assert_eq!(binary_to_safe_utf8(&[b'o', b'k', 0xff, 0xfe]), "ok");
    }

    #[test]
    fn test_retryable_classification() {
        let timeout = HttpError::Timeout {
            url: "http://x".into(),
        };
        assert!(timeout.is_retryable());

        let server = HttpError::Status {
            status: StatusCode::BAD_GATEWAY,
            url: "http://x".into(),
        };
        assert!(server.is_retryable());

        let not_found = HttpError::Status {
            status: StatusCode::NOT_FOUND,
            url: "http://x".into(),
        };
        assert!(!not_found.is_retryable());
        assert!(not_found.is_not_found());

        let decode = HttpError::Decode {
            url: "http://x".into(),
            message: "bad json".into(),
        };
        assert!(!decode.is_retryable());
    }

    #[test]
    fn test_anyhow_downcast() {
        let err = anyhow::Error::new(HttpError::Timeout {
            url: "http://x".into(),
        })
        .context("fetching task log");
        assert!(is_retryable_error(&err));

        let other = anyhow::anyhow!("some bug");
        assert!(!is_retryable_error(&other));
    }
}

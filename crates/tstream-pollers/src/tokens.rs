use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// A token is only served while it has at least this much lifetime left.
pub const TOKEN_LATENCY_BUFFER_SECS: i64 = 60;

fn latency_buffer() -> ChronoDuration {
    ChronoDuration::seconds(TOKEN_LATENCY_BUFFER_SECS)
}

#[derive(Debug, Clone)]
pub struct CachedToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Access-token cache keyed by token id (the key identifier for
/// key-based auth, or the service email for instance-metadata auth).
#[derive(Default)]
pub struct TokenCache {
    entries: Mutex<HashMap<String, CachedToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cached token, iff it is still valid past the latency buffer.
    pub fn get(&self, token_id: &str) -> Option<String> {
        let entries = self.entries.lock().expect("token cache lock poisoned");
        entries.get(token_id).and_then(|token| {
            if token.expires_at > Utc::now() + latency_buffer() {
                Some(token.access_token.clone())
            } else {
                None
            }
        })
    }

    /// Store a token; expired entries are pruned on every insert.
    pub fn insert(&self, token_id: impl Into<String>, access_token: String, expires_in_secs: i64) {
        let mut entries = self.entries.lock().expect("token cache lock poisoned");
        let now = Utc::now();
        entries.retain(|_, token| token.expires_at > now);
        entries.insert(
            token_id.into(),
            CachedToken {
                access_token,
                expires_at: now + ChronoDuration::seconds(expires_in_secs),
            },
        );
    }

    pub fn invalidate(&self, token_id: &str) {
        self.entries
            .lock()
            .expect("token cache lock poisoned")
            .remove(token_id);
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .expect("token cache lock poisoned")
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("token cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How to obtain a fresh access token
#[derive(Debug, Clone)]
pub enum TokenRequest {
    /// Exchange a signed assertion at an OAuth token endpoint
    JwtBearer {
        token_endpoint: String,
        assertion: String,
    },
    /// Ask the instance metadata service for the default service
    /// account's token
    InstanceMetadata { metadata_url: String },
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

/// Fetch a token, consult the cache first; a miss requests a new token
/// and stores it.
pub async fn fetch_token(
    cache: &TokenCache,
    client: &reqwest::Client,
    token_id: &str,
    request: &TokenRequest,
) -> Result<String> {
    if let Some(token) = cache.get(token_id) {
        debug!(token_id, "token cache hit");
        return Ok(token);
    }

    let response = match request {
        TokenRequest::JwtBearer {
            token_endpoint,
            assertion,
        } => {
            let params = [
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ];
            client
                .post(token_endpoint)
                .form(&params)
                .send()
                .await
                .context("token endpoint request failed")?
                .error_for_status()
                .context("token endpoint rejected the assertion")?
                .json::<TokenResponse>()
                .await
                .context("token endpoint returned malformed JSON")?
        }
        TokenRequest::InstanceMetadata { metadata_url } => client
            .get(metadata_url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .context("metadata service request failed")?
            .error_for_status()
            .context("metadata service rejected the request")?
            .json::<TokenResponse>()
            .await
            .context("metadata service returned malformed JSON")?,
    };

    cache.insert(token_id, response.access_token.clone(), response.expires_in);
    Ok(response.access_token)
}

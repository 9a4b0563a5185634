//! GitHub REST client used by the polling and hook-check jobs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, ETAG, HeaderMap, IF_NONE_MATCH, USER_AGENT};
use serde::Deserialize;
use tracing::debug;

use hubjobs_core::Identifier;
use hubjobs_jobs::{ApiError, EventsPage, RemoteApi};

use crate::config::WorkerConfig;

const ACCEPT_JSON: &str = "application/vnd.github+json";
const AGENT: &str = "hubjobs-worker";
const TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum GithubError {
    #[error("cannot build HTTP client: {0}")]
    Client(String),
}

#[derive(Debug, Deserialize)]
struct Hook {
    active: bool,
    #[serde(default)]
    config: HookConfig,
}

#[derive(Debug, Default, Deserialize)]
struct HookConfig {
    url: Option<String>,
}

/// Blocking client for the repository events and hooks endpoints.
///
/// Event polls are conditional: the last `ETag` of each repository is kept and
/// an unchanged stream (`304`) counts as zero updates.
pub struct GithubClient {
    http: Client,
    api_url: String,
    token: Option<String>,
    token_id: Identifier,
    hook_url: Option<String>,
    etags: Mutex<HashMap<Identifier, String>>,
}

impl GithubClient {
    pub fn new(api_url: impl Into<String>, token: Option<String>) -> Result<Self, GithubError> {
        let http = Client::builder()
            .timeout(TIMEOUT)
            .build()
            .map_err(|e| GithubError::Client(e.to_string()))?;
        Ok(Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token,
            token_id: Identifier::from(crate::config::DEFAULT_GITHUB_TOKEN_ID),
            hook_url: None,
            etags: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_config(config: &WorkerConfig) -> Result<Self, GithubError> {
        Ok(Self::new(&config.github_api_url, config.github_token.clone())?
            .with_token_id(config.github_token_id.as_str())
            .with_hook_url(config.github_hook_url.clone()))
    }

    /// Name the token is tracked under in the token directory.
    pub fn with_token_id(mut self, token_id: impl Into<Identifier>) -> Self {
        self.token_id = token_id.into();
        self
    }

    /// Only hooks delivering to `hook_url` count as set.
    pub fn with_hook_url(mut self, hook_url: Option<String>) -> Self {
        self.hook_url = hook_url;
        self
    }

    fn get(&self, path: &str) -> RequestBuilder {
        let req = self
            .http
            .get(format!("{}{path}", self.api_url))
            .header(ACCEPT, ACCEPT_JSON)
            .header(USER_AGENT, AGENT);
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn send(&self, req: RequestBuilder) -> Result<Response, ApiError> {
        let resp = req
            .send()
            .map_err(|e| ApiError::Unavailable(e.to_string()))?;
        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return Ok(resp);
        }
        let url = resp.url().to_string();
        Err(classify(status, resp.headers(), &url))
    }
}

/// Map an unsuccessful response to an [`ApiError`].
fn classify(status: StatusCode, headers: &HeaderMap, url: &str) -> ApiError {
    let exhausted = header_u64(headers, "x-ratelimit-remaining") == Some(0);
    if status == StatusCode::TOO_MANY_REQUESTS || (status == StatusCode::FORBIDDEN && exhausted) {
        let reset_in = header_u64(headers, "retry-after").or_else(|| {
            header_u64(headers, "x-ratelimit-reset")
                .map(|reset| reset.saturating_sub(Utc::now().timestamp().max(0) as u64))
        });
        return ApiError::RateLimited { reset_in };
    }
    match status {
        StatusCode::NOT_FOUND => ApiError::NotFound(url.to_string()),
        s if s.is_server_error() => ApiError::Unavailable(format!("{s} from {url}")),
        s => ApiError::Unexpected(format!("{s} from {url}")),
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

fn hook_matches(hook: &Hook, hook_url: Option<&str>) -> bool {
    hook.active
        && match hook_url {
            Some(expected) => hook.config.url.as_deref() == Some(expected),
            None => true,
        }
}

impl RemoteApi for GithubClient {
    fn fetch_events(&self, repository: &Identifier) -> Result<EventsPage, ApiError> {
        let mut req = self.get(&format!("/repositories/{repository}/events"));
        let etag = self.etags.lock().unwrap().get(repository).cloned();
        if let Some(etag) = etag {
            req = req.header(IF_NONE_MATCH, etag);
        }

        let resp = self.send(req)?;
        let suggested_delay = header_u64(resp.headers(), "x-poll-interval");

        if resp.status() == StatusCode::NOT_MODIFIED {
            debug!(identifier = %repository, "events unchanged");
            return Ok(EventsPage {
                updated_count: 0,
                suggested_delay,
            });
        }

        if let Some(etag) = resp.headers().get(ETAG).and_then(|v| v.to_str().ok()) {
            self.etags
                .lock()
                .unwrap()
                .insert(repository.clone(), etag.to_string());
        }
        let events: Vec<serde_json::Value> = resp
            .json()
            .map_err(|e| ApiError::Unexpected(e.to_string()))?;

        Ok(EventsPage {
            updated_count: events.len() as u64,
            suggested_delay,
        })
    }

    fn hook_is_set(&self, repository: &Identifier) -> Result<bool, ApiError> {
        let resp = self.send(self.get(&format!("/repositories/{repository}/hooks")))?;
        let hooks: Vec<Hook> = resp
            .json()
            .map_err(|e| ApiError::Unexpected(e.to_string()))?;
        Ok(hooks
            .iter()
            .any(|h| hook_matches(h, self.hook_url.as_deref())))
    }

    fn token(&self) -> Option<Identifier> {
        self.token.as_ref().map(|_| self.token_id.clone())
    }
}

//! Shared REST client for the source platforms.
//!
//! Authentication is a bearer token obtained from a login endpoint. The
//! token expiry is the lesser of the idle and absolute session expirations
//! the platform reports in response headers; the token is renewed shortly
//! before it expires, renewal is serialized per client, and a 401 response
//! triggers exactly one re-login and retry of the offending request.

use anyhow::{anyhow, Context};
use chrono::{DateTime, Duration, Utc};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const TOKEN_REFRESH_MARGIN_MINUTES: i64 = 2;
// Login responses don't always carry the expiration headers; assume the
// token will nearly immediately be used with an endpoint that does.
const DEFAULT_TOKEN_LIFETIME_MINUTES: i64 = 60;

const HEADER_SESSION_EXPIRATION: &str = "Session-Expiration";
const HEADER_ABSOLUTE_SESSION_EXPIRATION: &str = "Absolute-Session-Expiration";

/// HTTP failure carrying the response body, so callers can recognize
/// platform-specific error shapes.
#[derive(Debug, Error)]
#[error("{method} {url} failed with status {status}")]
pub struct HttpStatusError {
    pub method: String,
    pub url: String,
    pub status: u16,
    pub body: String,
}

struct AuthToken {
    value: String,
    expiry: DateTime<Utc>,
}

/// REST client with token authentication and single-retry on 401.
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    token: Mutex<Option<AuthToken>>,
}

impl RestClient {
    pub fn new(base_url: String, username: String, password: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            username,
            password,
            token: Mutex::new(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GETs the path and deserializes the JSON response. Non-success
    /// statuses become [`HttpStatusError`] with the body attached.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> anyhow::Result<T> {
        let response = self.send(Method::GET, path, query).await?;
        let status = response.status();
        if !status.is_success() {
            let url = response.url().to_string();
            let body = response.text().await.unwrap_or_default();
            return Err(HttpStatusError {
                method: Method::GET.to_string(),
                url,
                status: status.as_u16(),
                body,
            }
            .into());
        }
        response
            .json()
            .await
            .with_context(|| format!("parsing GET {path} response"))
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
    ) -> anyhow::Result<reqwest::Response> {
        let token = self.current_token().await?;
        let response = self.dispatch(&method, path, query, &token).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            // The session died under us; retried exactly once with a fresh
            // token.
            warn!(path, "source API returned 401, re-authenticating");
            let token = self.refresh_token().await?;
            let response = self.dispatch(&method, path, query, &token).await?;
            self.note_token_expiry(response.headers()).await;
            return Ok(response);
        }

        self.note_token_expiry(response.headers()).await;
        Ok(response)
    }

    async fn dispatch(
        &self,
        method: &Method,
        path: &str,
        query: &[(&str, String)],
        token: &str,
    ) -> anyhow::Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(method.clone(), &url).bearer_auth(token);
        if !query.is_empty() {
            request = request.query(query);
        }

        let started = std::time::Instant::now();
        let result = request.send().await;
        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(response) => {
                debug!(%method, url, status = %response.status(), duration_ms, "source API call")
            }
            Err(error) => debug!(%method, url, %error, duration_ms, "source API call failed"),
        }
        result.with_context(|| format!("{method} {url}"))
    }

    /// The current token, renewed under the lock when missing or close to
    /// its expiry.
    async fn current_token(&self) -> anyhow::Result<String> {
        let mut token = self.token.lock().await;
        let needs_refresh = match token.as_ref() {
            Some(token) => {
                Utc::now() + Duration::minutes(TOKEN_REFRESH_MARGIN_MINUTES) >= token.expiry
            }
            None => true,
        };
        if needs_refresh {
            *token = Some(self.login().await?);
        }
        token
            .as_ref()
            .map(|token| token.value.clone())
            .ok_or_else(|| anyhow!("token renewal yielded no token"))
    }

    async fn refresh_token(&self) -> anyhow::Result<String> {
        let mut token = self.token.lock().await;
        let fresh = self.login().await?;
        let value = fresh.value.clone();
        *token = Some(fresh);
        Ok(value)
    }

    async fn login(&self) -> anyhow::Result<AuthToken> {
        let url = format!("{}/api/auth/login", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&json!({"username": self.username, "password": self.password}))
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HttpStatusError {
                method: Method::POST.to_string(),
                url,
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let expiry = expiry_from_headers(response.headers()).unwrap_or_else(|| {
            Utc::now() + Duration::minutes(DEFAULT_TOKEN_LIFETIME_MINUTES)
        });
        let value = response
            .text()
            .await
            .context("reading login response")?
            .trim()
            .to_string();
        Ok(AuthToken { value, expiry })
    }

    /// Responses advertise the remaining session lifetime; keep the local
    /// expiry in sync so renewal happens before the server-side cutoff.
    async fn note_token_expiry(&self, headers: &HeaderMap) {
        if let Some(expiry) = expiry_from_headers(headers) {
            let mut token = self.token.lock().await;
            if let Some(token) = token.as_mut() {
                token.expiry = expiry;
            }
        }
    }
}

fn expiry_from_headers(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    let idle = parse_http_date(headers, HEADER_SESSION_EXPIRATION);
    let absolute = parse_http_date(headers, HEADER_ABSOLUTE_SESSION_EXPIRATION);
    lenient_min(idle, absolute)
}

fn parse_http_date(headers: &HeaderMap, name: &str) -> Option<DateTime<Utc>> {
    let raw = headers.get(name)?.to_str().ok()?;
    DateTime::parse_from_rfc2822(raw)
        .ok()
        .map(|date| date.with_timezone(&Utc))
}

fn lenient_min(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

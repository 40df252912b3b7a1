//! Client for the upstream registry REST API.
//!
//! Every call is bounded by [`ApiConfig::timeout`]. Abandoning a call only
//! drops the page-side future; anything the worker started on its behalf
//! still runs to completion.

use std::sync::Arc;
use std::time::Duration;

use http::header::{ACCEPT, AUTHORIZATION};
use http::HeaderValue;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;
use watch_common::with_timeout;

use crate::{Fetcher, NetError, Request, Response};

const DEFAULT_VALIDATOR_URL: &str = "https://api.algundominio.link/spaceships/models/validator";

/// Where the registry API lives and how long callers wait for it.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Application domain, without trailing slash.
    pub app_domain: String,
    /// Unauthenticated model validator endpoint.
    pub validator_url: Url,
    /// Deadline for every call.
    pub timeout: Duration,
}

impl ApiConfig {
    pub fn new(app_domain: &str) -> Result<Self, NetError> {
        let app_domain = app_domain.trim().trim_end_matches('/').to_string();
        if app_domain.is_empty() {
            return Err(NetError::InvalidUrl("app domain is not configured".to_string()));
        }
        Url::parse(&app_domain).map_err(|e| NetError::InvalidUrl(e.to_string()))?;

        Ok(Self {
            app_domain,
            validator_url: Url::parse(DEFAULT_VALIDATOR_URL)
                .map_err(|e| NetError::InvalidUrl(e.to_string()))?,
            timeout: Duration::from_secs(5),
        })
    }

    pub fn with_validator_url(mut self, url: Url) -> Self {
        self.validator_url = url;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `<app_domain>/api<path>`, adding the leading slash when missing.
    pub fn api_url(&self, path: &str) -> Result<Url, NetError> {
        let base = format!("{}/api", self.app_domain);
        let full = if path.is_empty() {
            base
        } else if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        };
        Url::parse(&full).map_err(|e| NetError::InvalidUrl(e.to_string()))
    }
}

/// A registry entry as returned by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spaceship {
    #[serde(default, deserialize_with = "string_or_number")]
    pub spaceship_id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub pilot: String,
    /// Fields the registry returns beyond the core three.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Payload for reporting a new registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewSpaceship {
    pub spaceship_id: String,
    pub model: String,
    pub pilot: String,
}

impl NewSpaceship {
    pub fn new(
        spaceship_id: impl Into<String>,
        model: impl Into<String>,
        pilot: impl Into<String>,
    ) -> Self {
        Self {
            spaceship_id: spaceship_id.into(),
            model: model.into(),
            pilot: pilot.into(),
        }
    }

    /// Trimmed copy; every field must be non-blank.
    fn normalized(&self) -> Result<Self, NetError> {
        let normalized = Self::new(
            self.spaceship_id.trim(),
            self.model.trim(),
            self.pilot.trim(),
        );
        if normalized.spaceship_id.is_empty()
            || normalized.model.is_empty()
            || normalized.pilot.is_empty()
        {
            return Err(NetError::InvalidInput("Please fill in all fields".to_string()));
        }
        Ok(normalized)
    }
}

impl From<NewSpaceship> for Spaceship {
    fn from(new: NewSpaceship) -> Self {
        Self {
            spaceship_id: new.spaceship_id,
            model: new.model,
            pilot: new.pilot,
            extra: serde_json::Map::new(),
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// Registry API client.
pub struct RegistryClient {
    config: ApiConfig,
    fetcher: Arc<dyn Fetcher>,
    token: Option<String>,
}

impl RegistryClient {
    pub fn new(config: ApiConfig, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            config,
            fetcher,
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn set_token(&mut self, token: Option<String>) {
        self.token = token;
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    async fn send(&self, request: Request) -> Result<Response, NetError> {
        let url = request.url.clone();
        let response = with_timeout(self.config.timeout, self.fetcher.fetch(request)).await??;
        debug!(url = %url, status = %response.status, "Registry API response");
        Ok(response)
    }

    fn authorized(&self, request: Request) -> Request {
        let request = request.header(ACCEPT, HeaderValue::from_static("application/json"));
        match self
            .token
            .as_deref()
            .and_then(|t| HeaderValue::try_from(format!("Bearer {t}")).ok())
        {
            Some(value) => request.header(AUTHORIZATION, value),
            None => request,
        }
    }

    /// Exchange credentials for a bearer token.
    pub async fn login(&self, username: &str, password: &str) -> Result<String, NetError> {
        let url = self.config.api_url("/login")?;
        let request = Request::post_json(
            url,
            &serde_json::json!({ "username": username, "password": password }),
        )?;
        let response = self.send(request).await?;

        if !response.ok() {
            let message = response
                .json::<Value>()
                .ok()
                .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| format!("Login failed ({})", response.status.as_u16()));
            return Err(NetError::Api {
                status: response.status,
                message,
            });
        }

        token_from_response(&response).ok_or_else(|| {
            NetError::RequestFailed("Login succeeded but token not found in response".to_string())
        })
    }

    /// List registry entries; accepts a bare array or `{ "items": [...] }`.
    pub async fn list_spaceships(&self) -> Result<Vec<Spaceship>, NetError> {
        let request = self.authorized(Request::get(self.config.api_url("/spaceships")?));
        let response = ensure_ok(self.send(request).await?)?;

        let data: Value = response.json()?;
        let items = match data {
            Value::Array(items) => items,
            Value::Object(mut map) => match map.remove("items") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };

        Ok(items
            .into_iter()
            .filter_map(|item| match serde_json::from_value(item) {
                Ok(ship) => Some(ship),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed registry entry");
                    None
                }
            })
            .collect())
    }

    /// Fetch one entry by identifier.
    pub async fn get_spaceship(&self, spaceship_id: &str) -> Result<Spaceship, NetError> {
        let path = format!("/spaceships/{}", urlencoding::encode(spaceship_id));
        let request = self.authorized(Request::get(self.config.api_url(&path)?));
        let response = ensure_ok(self.send(request).await?)?;
        response.json()
    }

    /// Report a new entry. An empty or non-JSON reply echoes the submitted entry.
    pub async fn create_spaceship(&self, new: &NewSpaceship) -> Result<Spaceship, NetError> {
        let new = new.normalized()?;
        let request = self.authorized(Request::post_json(
            self.config.api_url("/spaceships")?,
            &new,
        )?);
        let response = ensure_ok(self.send(request).await?)?;

        Ok(response.json().unwrap_or_else(|_| Spaceship::from(new)))
    }

    /// Ask the validator whether `model` is known. Any failure counts as invalid.
    pub async fn validate_model(&self, model: &str) -> bool {
        let mut url = self.config.validator_url.clone();
        url.query_pairs_mut().append_pair("model", model);

        match self.send(Request::get(url)).await {
            Ok(response) => response.ok(),
            Err(e) => {
                debug!(model, error = %e, "Model validation failed");
                false
            }
        }
    }
}

fn ensure_ok(response: Response) -> Result<Response, NetError> {
    if response.ok() {
        return Ok(response);
    }
    Err(NetError::Api {
        status: response.status,
        message: error_message(&response),
    })
}

/// JSON `error`/`message`, else the body text, else the status reason.
fn error_message(response: &Response) -> String {
    if let Ok(data) = response.json::<Value>() {
        if let Some(message) = ["error", "message"]
            .iter()
            .find_map(|key| data.get(*key).and_then(Value::as_str))
        {
            return message.to_string();
        }
    }
    if let Ok(text) = response.text() {
        if !text.trim().is_empty() {
            return text;
        }
    }
    response
        .status
        .canonical_reason()
        .map(str::to_string)
        .unwrap_or_else(|| format!("Request failed ({})", response.status.as_u16()))
}

fn token_from_response(response: &Response) -> Option<String> {
    let from_header = response.header("authorization").and_then(|value| {
        let (scheme, rest) = value.split_once(char::is_whitespace)?;
        let token = rest.trim_start();
        (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_string())
    });
    if from_header.is_some() {
        return from_header;
    }

    match response.json::<Value>().ok()? {
        Value::String(token) => Some(token),
        Value::Object(map) => ["token", "access_token", "jwt"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
            .map(str::to_string),
        _ => None,
    }
}

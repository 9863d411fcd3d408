//! ELBA portal REST client.
//!
//! The portal's Angular frontend talks to JSON endpoints under
//! `https://mein.elba.raiffeisen.at/api`, authenticated by a bearer token
//! plus the session cookies. [`PortalClient`] reuses both, taken from the
//! browser session by the orchestrator.

mod endpoints;

pub use endpoints::{DocumentsEndpoint, PagedEndpoint, TransactionsEndpoint};

use std::sync::Arc;

use anyhow::Context;
use chrono::NaiveDate;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;

use crate::browser::BrowserCookie;
use crate::collect::{Cursor, Page};
use crate::config::{PortalConfig, TimeoutConfig};
use crate::credentials::BearerToken;
use crate::debug::DebugDumper;
use crate::error::SessionError;

pub const PRODUCTS_PATH: &str = "/bankingws-widgetsystem/bankingws-ui/rest/produkte?skipImages=true";
pub const TRANSACTIONS_PATH: &str = "/bankingzv-umsatz/umsatz-ui/rest/kontoumsaetze";
pub const DOCUMENTS_PATH: &str = "/bankingquer-dokumentenablage/dokumentenablage-ui/rest/dokumente/filter";
pub const POSITIONS_PATH: &str = "/bankingwp-depotzentrale/depotzentrale-ui/rest/positionsuebersicht";

/// Longest response body quoted in an error message.
const MAX_ERROR_BODY: usize = 500;

/// Credentials handed to an operation: bearer token plus browser cookies.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub token: BearerToken,
    pub cookies: Vec<BrowserCookie>,
}

impl AuthContext {
    pub fn new(token: BearerToken) -> Self {
        Self {
            token,
            cookies: Vec::new(),
        }
    }

    pub fn with_cookies(mut self, cookies: Vec<BrowserCookie>) -> Self {
        self.cookies = cookies;
        self
    }

    /// `Cookie` header for requests to `host`, if any cookie applies.
    pub fn cookie_header(&self, host: &str) -> Option<String> {
        let header = self
            .cookies
            .iter()
            .filter(|c| c.matches_host(host))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ");
        (!header.is_empty()).then_some(header)
    }
}

/// HTTP client for the portal's JSON API.
pub struct PortalClient {
    client: Client,
    api_base: String,
    host: String,
    debug: Option<Arc<DebugDumper>>,
}

impl PortalClient {
    pub fn new(portal: &PortalConfig, timeouts: &TimeoutConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(portal.user_agent.as_str())
            .timeout(timeouts.request)
            .build()
            .context("Failed to create HTTP client")?;
        let api_base = portal.api_base.trim_end_matches('/').to_string();
        let host = reqwest::Url::parse(&api_base)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| portal.authenticated_host.clone());

        Ok(Self {
            client,
            api_base,
            host,
            debug: None,
        })
    }

    /// Dump every response body through `dumper`.
    pub fn with_debug(mut self, dumper: Arc<DebugDumper>) -> Self {
        self.debug = Some(dumper);
        self
    }

    pub(crate) fn dump(&self, prefix: &str, payload: &Value) {
        if let Some(debug) = &self.debug {
            debug.dump(prefix, payload);
        }
    }

    /// Make an authenticated request and parse the JSON body.
    async fn request(
        &self,
        ctx: &AuthContext,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, SessionError> {
        let url = format!("{}{}", self.api_base, path);
        let correlation_id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(method = method.as_str(), %url, %correlation_id, "Portal request");

        let mut req = self
            .client
            .request(method, &url)
            .header("authorization", ctx.token.header_value())
            .header("accept", "application/json, text/plain, */*")
            .header("x-correlation-id", &correlation_id);
        if let Some(cookies) = ctx.cookie_header(&self.host) {
            req = req.header("cookie", cookies);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let response = req.send().await.context("HTTP request failed")?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            tracing::info!(status = status.as_u16(), %url, "Bearer token rejected");
            return Err(SessionError::AuthorizationExpired {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body = truncate(&body, MAX_ERROR_BODY);
            if status == StatusCode::SERVICE_UNAVAILABLE {
                return Err(SessionError::TransientService(format!(
                    "API request failed ({status}): {body}"
                )));
            }
            return Err(anyhow::anyhow!("API request failed ({status}): {body}").into());
        }

        let text = response.text().await.context("Failed to read response")?;
        let value: Value = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse JSON response from {path}"))?;
        Ok(value)
    }

    pub async fn get_json(&self, ctx: &AuthContext, path: &str) -> Result<Value, SessionError> {
        self.request(ctx, Method::GET, path, None).await
    }

    pub async fn post_json(
        &self,
        ctx: &AuthContext,
        path: &str,
        body: &Value,
    ) -> Result<Value, SessionError> {
        self.request(ctx, Method::POST, path, Some(body)).await
    }

    /// All banking products (accounts, cards, depots) on the dashboard.
    pub async fn products(&self, ctx: &AuthContext) -> Result<Vec<Value>, SessionError> {
        let value = self.get_json(ctx, PRODUCTS_PATH).await?;
        self.dump("products-raw", &value);
        match value {
            Value::Array(items) => {
                tracing::info!(count = items.len(), "Fetched products");
                Ok(items)
            }
            other => Err(anyhow::anyhow!(
                "Unexpected products response: {}",
                truncate(&other.to_string(), MAX_ERROR_BODY)
            )
            .into()),
        }
    }

    /// Depot positions, optionally as of a past date.
    pub async fn positions(
        &self,
        ctx: &AuthContext,
        depot_id: &str,
        as_of: Option<NaiveDate>,
    ) -> Result<Value, SessionError> {
        let mut path = format!("{POSITIONS_PATH}/{}", urlencoding::encode(depot_id));
        if let Some(date) = as_of {
            path.push_str(&format!("/{}", date.format("%Y-%m-%d")));
        }
        let value = self.get_json(ctx, &path).await?;
        self.dump("portfolio-raw", &value);
        Ok(value)
    }
}

/// Cut `s` to at most `max` bytes on a char boundary.
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Split a list response into a [`Page`].
///
/// Accepts a bare array, or an object holding the list under the first of
/// `item_keys` that is present. An object may also carry `hasMore` /
/// `moreRecordsIndicator` and `nextCursor` / `nextPage`.
pub fn parse_envelope(value: Value, item_keys: &[&str]) -> Result<Page<Value>, SessionError> {
    match value {
        Value::Array(items) => Ok(Page::new(items)),
        Value::Object(mut map) => {
            let items = item_keys
                .iter()
                .find_map(|k| match map.remove(*k) {
                    Some(Value::Array(items)) => Some(items),
                    _ => None,
                })
                .ok_or_else(|| {
                    anyhow::anyhow!("Response has none of the list fields {item_keys:?}")
                })?;
            let has_more = ["hasMore", "moreRecordsIndicator"]
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_bool));
            let next_cursor = ["nextCursor", "nextPage"]
                .iter()
                .find_map(|k| map.get(*k).and_then(Cursor::from_json));
            Ok(Page {
                items,
                next_cursor,
                has_more,
            })
        }
        other => Err(anyhow::anyhow!(
            "Unexpected list response: {}",
            truncate(&other.to_string(), MAX_ERROR_BODY)
        )
        .into()),
    }
}

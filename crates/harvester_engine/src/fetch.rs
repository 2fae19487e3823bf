use std::error::Error;
use std::time::Duration;

use futures_util::StreamExt;
use harvester_core::{AttemptOutcome, FailureKind, UnitFailure, UnitSummary};
use reqwest::header::{HeaderMap, SET_COOKIE};
use tokio::time::Instant;

use crate::{HarvestUnit, ProxyEndpoint, UnitExecutor};

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub connect_timeout: Duration,
    pub redirect_limit: usize,
    pub max_bytes: u64,
    /// Statuses answered by anti-bot walls rather than by the page.
    pub block_statuses: Vec<u16>,
    /// Body fragments that only appear on challenge pages.
    pub block_markers: Vec<String>,
    /// Fragment counted once per collected item, e.g. `data-asin="`.
    pub item_marker: Option<String>,
    /// Cookie the site only hands out once its challenge is passed. A session
    /// counts as cookie-verified when a successful response sets it.
    pub verified_cookie: Option<String>,
    pub user_agent: Option<String>,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            redirect_limit: 5,
            max_bytes: 5 * 1024 * 1024,
            block_statuses: vec![403, 429, 503],
            block_markers: vec![
                "validateCaptcha".to_string(),
                "Type the characters you see in this image".to_string(),
            ],
            item_marker: None,
            verified_cookie: None,
            user_agent: None,
        }
    }
}

/// Fetches a unit's target page through the leased proxy.
#[derive(Debug, Clone, Default)]
pub struct ReqwestExecutor {
    settings: FetchSettings,
}

struct FetchedPage {
    body: String,
    bytes: u64,
    cookie_verified: bool,
}

impl ReqwestExecutor {
    pub fn new(settings: FetchSettings) -> Self {
        Self { settings }
    }

    fn build_client(
        &self,
        proxy: &ProxyEndpoint,
        timeout: Duration,
    ) -> Result<reqwest::Client, UnitFailure> {
        let egress = reqwest::Proxy::all(proxy.url.as_str())
            .map_err(|err| UnitFailure::new(FailureKind::ProxyUnreachable, err.to_string()))?;
        let mut builder = reqwest::Client::builder()
            .proxy(egress)
            .connect_timeout(self.settings.connect_timeout.min(timeout))
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(
                self.settings.redirect_limit,
            ));
        if let Some(agent) = &self.settings.user_agent {
            builder = builder.user_agent(agent.clone());
        }
        builder
            .build()
            .map_err(|err| UnitFailure::new(FailureKind::Network, err.to_string()))
    }

    fn block_marker_in<'a>(&'a self, body: &str) -> Option<&'a str> {
        self.settings
            .block_markers
            .iter()
            .find(|marker| !marker.is_empty() && body.contains(marker.as_str()))
            .map(String::as_str)
    }

    fn sets_verified_cookie(&self, headers: &HeaderMap) -> bool {
        let Some(wanted) = self.settings.verified_cookie.as_deref() else {
            return false;
        };
        headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|cookie| cookie.split_once('='))
            .any(|(name, rest)| {
                name.trim() == wanted
                    && rest.split(';').next().is_some_and(|value| !value.trim().is_empty())
            })
    }

    fn count_items(&self, body: &str) -> u64 {
        match self.settings.item_marker.as_deref() {
            Some(marker) if !marker.is_empty() => body.matches(marker).count() as u64,
            _ => 0,
        }
    }

    async fn fetch(
        &self,
        unit: &HarvestUnit,
        proxy: &ProxyEndpoint,
        deadline: Instant,
    ) -> Result<FetchedPage, UnitFailure> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(UnitFailure::new(FailureKind::Timeout, "deadline already passed"));
        }
        let target = reqwest::Url::parse(&unit.target)
            .map_err(|err| UnitFailure::new(FailureKind::Network, format!("bad target: {err}")))?;
        let client = self.build_client(proxy, remaining)?;

        let response = client.get(target).send().await.map_err(map_reqwest_error)?;

        let status = response.status();
        if self.settings.block_statuses.contains(&status.as_u16()) {
            return Err(UnitFailure::new(FailureKind::Blocked, format!("http status {status}")));
        }
        if !status.is_success() {
            return Err(UnitFailure::new(
                FailureKind::Network,
                format!("http status {status}"),
            ));
        }
        if let Some(content_len) = response.content_length() {
            if content_len > self.settings.max_bytes {
                return Err(UnitFailure::new(
                    FailureKind::Network,
                    format!("response too large ({content_len} bytes)"),
                ));
            }
        }
        let cookie_verified = self.sets_verified_cookie(response.headers());

        let mut bytes = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_reqwest_error)?;
            let next_len = bytes.len() as u64 + chunk.len() as u64;
            if next_len > self.settings.max_bytes {
                return Err(UnitFailure::new(
                    FailureKind::Network,
                    format!("response too large ({next_len} bytes)"),
                ));
            }
            bytes.extend_from_slice(&chunk);
        }

        Ok(FetchedPage {
            bytes: bytes.len() as u64,
            body: String::from_utf8_lossy(&bytes).into_owned(),
            cookie_verified,
        })
    }
}

#[async_trait::async_trait]
impl UnitExecutor for ReqwestExecutor {
    async fn execute(
        &self,
        unit: &HarvestUnit,
        proxy: &ProxyEndpoint,
        deadline: Instant,
    ) -> AttemptOutcome {
        let started = Instant::now();
        let result = self.fetch(unit, proxy, deadline).await;
        let response_time_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(page) => match self.block_marker_in(&page.body) {
                Some(marker) => AttemptOutcome::Blocked {
                    reason: format!("challenge page ({marker})"),
                },
                None => AttemptOutcome::Success {
                    summary: UnitSummary {
                        items_collected: self.count_items(&page.body),
                        bytes: page.bytes,
                    },
                    response_time_ms,
                    cookie_verified: page.cookie_verified,
                },
            },
            Err(failure) if failure.kind == FailureKind::Blocked => AttemptOutcome::Blocked {
                reason: failure.message,
            },
            Err(failure) => AttemptOutcome::Failure {
                failure,
                response_time_ms,
            },
        }
    }
}

fn map_reqwest_error(err: reqwest::Error) -> UnitFailure {
    if err.is_timeout() {
        return UnitFailure::new(FailureKind::Timeout, err.to_string());
    }
    if err.is_connect() {
        let kind = if tunnel_refused(&err) {
            FailureKind::Network
        } else {
            FailureKind::ProxyUnreachable
        };
        return UnitFailure::new(kind, error_chain(&err));
    }
    if err.is_redirect() {
        return UnitFailure::new(FailureKind::Network, "redirect limit exceeded");
    }
    UnitFailure::new(FailureKind::Network, err.to_string())
}

/// True when the proxy answered `CONNECT` itself, with a non-2xx status or an
/// auth demand, rather than failing to accept the connection.
fn tunnel_refused(err: &reqwest::Error) -> bool {
    let mut source: Option<&dyn Error> = err.source();
    while let Some(cause) = source {
        let message = cause.to_string().to_ascii_lowercase();
        if message.contains("unsuccessful") || message.contains("proxy auth") {
            return true;
        }
        source = cause.source();
    }
    false
}

fn error_chain(err: &reqwest::Error) -> String {
    let mut text = err.to_string();
    let mut source: Option<&dyn Error> = err.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

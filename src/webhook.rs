//! Posting and editing single-embed webhook messages.
//!
//! Every request goes through the per-destination limiter. Responses are
//! sorted into success, retryable 429, long cooldown and edge hard block.
//! Short 429s are retried once in place; anything longer becomes a
//! destination cooldown that the pass observes and stops on.

use crate::embed::Embed;
use crate::rate_limit::Limiters;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;

/// Longest retry-after that is slept through in place instead of becoming a cooldown.
pub const INLINE_RETRY_MAX: Duration = Duration::from_secs(10);
const RETRY_AFTER_FLOOR: f64 = 0.5;
const RETRY_AFTER_CEILING: f64 = 60.0;
const RETRY_AFTER_DEFAULT: f64 = 1.0;
const EDGE_BLOCK_MARKERS: [&str; 3] = ["error 1015", "you are being rate limited", "cloudflare"];

#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub method: Method,
    pub url: String,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct WebhookResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

/// Sends one HTTP request. Kept behind a trait so the delivery protocol can be
/// driven without a network.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn send(&self, request: WebhookRequest) -> Result<WebhookResponse>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let user_agent = format!("dota_notifier/{}", env!("CARGO_PKG_VERSION"));
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .user_agent(user_agent)
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn send(&self, request: WebhookRequest) -> Result<WebhookResponse> {
        let res = self
            .client
            .request(request.method, &request.url)
            .json(&request.body)
            .send()
            .await
            .context("webhook request failed")?;
        let status = res.status();
        let headers = res.headers().clone();
        let body = res.text().await.context("reading webhook body failed")?;
        Ok(WebhookResponse {
            status,
            headers,
            body,
        })
    }
}

/// Where a retry-after value was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAfterSource {
    ResetAfterHeader,
    RetryAfterHeader,
    JsonBody,
}

/// Normalizes a retry-after value into a sleep duration.
///
/// The JSON field is sometimes sent in milliseconds: values above 60 are
/// divided by 1000 and values below 0.2 multiplied by 1000. The result is
/// clamped to `[0.5s, 60s]` for every source.
pub fn normalize_retry_after(value: f64, source: RetryAfterSource) -> Duration {
    let mut secs = if value.is_finite() { value } else { RETRY_AFTER_DEFAULT };
    if source == RetryAfterSource::JsonBody {
        if secs > 60.0 {
            secs /= 1000.0;
        } else if secs < 0.2 {
            secs *= 1000.0;
        }
    }
    Duration::from_secs_f64(secs.clamp(RETRY_AFTER_FLOOR, RETRY_AFTER_CEILING))
}

fn header_secs(headers: &HeaderMap, name: &str) -> Option<f64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
}

/// Reads retry-after from, in order: `X-RateLimit-Reset-After`,
/// `Retry-After`, then the body's `retry_after` field.
pub fn retry_after(headers: &HeaderMap, body: &str) -> Duration {
    #[derive(Deserialize)]
    struct RateLimitBody {
        retry_after: Option<f64>,
    }

    if let Some(v) = header_secs(headers, "x-ratelimit-reset-after") {
        return normalize_retry_after(v, RetryAfterSource::ResetAfterHeader);
    }
    if let Some(v) = header_secs(headers, "retry-after") {
        return normalize_retry_after(v, RetryAfterSource::RetryAfterHeader);
    }
    match serde_json::from_str::<RateLimitBody>(body)
        .ok()
        .and_then(|b| b.retry_after)
    {
        Some(v) => normalize_retry_after(v, RetryAfterSource::JsonBody),
        None => normalize_retry_after(RETRY_AFTER_DEFAULT, RetryAfterSource::RetryAfterHeader),
    }
}

pub fn is_edge_block(headers: &HeaderMap, body: &str) -> bool {
    let is_html = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("text/html"));
    if !is_html {
        return false;
    }
    let lower = body.to_ascii_lowercase();
    EDGE_BLOCK_MARKERS.iter().any(|m| lower.contains(m))
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Classified {
    Success { message_id: Option<String> },
    RateLimited(Duration),
    HardBlocked,
    Failed,
}

pub(crate) fn classify(response: &WebhookResponse, wants_id: bool) -> Classified {
    #[derive(Deserialize)]
    struct Message {
        id: Option<String>,
    }

    match response.status {
        StatusCode::OK | StatusCode::NO_CONTENT => {
            let message_id = if wants_id && response.status == StatusCode::OK {
                serde_json::from_str::<Message>(&response.body)
                    .ok()
                    .and_then(|m| m.id)
            } else {
                None
            };
            Classified::Success { message_id }
        }
        _ if is_edge_block(&response.headers, &response.body) => Classified::HardBlocked,
        StatusCode::TOO_MANY_REQUESTS => {
            Classified::RateLimited(retry_after(&response.headers, &response.body))
        }
        _ => Classified::Failed,
    }
}

/// Drops the query string and fragment so the URL can key limiter state and
/// serve as the base for edits.
pub fn strip_query(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => url.split(['?', '#']).next().unwrap_or(url).to_string(),
    }
}

fn with_wait(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.query_pairs_mut().append_pair("wait", "true");
            parsed.to_string()
        }
        Err(_) if url.contains('?') => format!("{url}&wait=true"),
        Err(_) => format!("{url}?wait=true"),
    }
}

pub fn edit_url(base: &str, message_id: &str) -> String {
    format!("{}/messages/{}", base.trim_end_matches('/'), message_id)
}

/// Result of a post or edit.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Delivered(Receipt),
    /// Non-fatal failure; the pass may continue.
    Failed,
    /// Destination asked for a long pause. The pass should stop.
    Cooldown(Duration),
    /// Edge rate limit. The pass must stop.
    HardBlocked,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
    pub message_id: Option<String>,
    /// Destination actually used, without query string.
    pub webhook_base: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostMode {
    /// No message id needed; the platform answers 204.
    FireAndForget,
    /// Appends `wait=true` so the platform returns the created message.
    WaitForMessage,
}

#[derive(Debug, Clone)]
pub struct WebhookOptions {
    /// When set, every post goes here instead of the URL it was given.
    pub debug_override: Option<String>,
    /// Log outgoing payloads.
    pub dump_payloads: bool,
    /// Pause after every successful request.
    pub settle: Duration,
    pub settle_jitter: Duration,
}

impl Default for WebhookOptions {
    fn default() -> Self {
        Self {
            debug_override: None,
            dump_payloads: false,
            settle: Duration::from_secs(1),
            settle_jitter: Duration::from_millis(400),
        }
    }
}

pub struct WebhookClient {
    transport: Arc<dyn WebhookTransport>,
    limiters: Arc<Limiters>,
    options: WebhookOptions,
}

impl WebhookClient {
    pub fn new(
        transport: Arc<dyn WebhookTransport>,
        limiters: Arc<Limiters>,
        options: WebhookOptions,
    ) -> Self {
        Self {
            transport,
            limiters,
            options,
        }
    }

    /// Destination a post to `url` actually goes to.
    pub fn resolve_post_url<'a>(&'a self, url: &'a str) -> &'a str {
        match self.options.debug_override.as_deref() {
            Some(debug) if !debug.is_empty() => debug,
            _ => url,
        }
    }

    pub async fn post(&self, url: &str, embed: &Embed, mode: PostMode) -> Delivery {
        let resolved = self.resolve_post_url(url);
        let base = strip_query(resolved);
        let target = match mode {
            PostMode::FireAndForget => resolved.to_string(),
            PostMode::WaitForMessage => with_wait(resolved),
        };
        self.deliver(
            Method::POST,
            &base,
            target,
            embed,
            mode == PostMode::WaitForMessage,
        )
        .await
    }

    /// Edits `message_id` at exactly `webhook_base`. The debug override is
    /// never applied here.
    pub async fn edit(&self, webhook_base: &str, message_id: &str, embed: &Embed) -> Delivery {
        let target = edit_url(webhook_base, message_id);
        self.deliver(Method::PATCH, webhook_base, target, embed, false)
            .await
    }

    pub fn is_hard_blocked(&self) -> bool {
        self.limiters.is_hard_blocked()
    }

    pub async fn cooldown_active(&self) -> bool {
        !self.cooldown_remaining().await.is_zero()
    }

    pub async fn cooldown_remaining(&self) -> Duration {
        self.limiters.webhook.max_cooldown_remaining().await
    }

    async fn deliver(
        &self,
        method: Method,
        base: &str,
        url: String,
        embed: &Embed,
        wants_id: bool,
    ) -> Delivery {
        if self.is_hard_blocked() {
            return Delivery::HardBlocked;
        }
        let pending_cooldown = self.limiters.webhook.cooldown_remaining(base).await;
        if !pending_cooldown.is_zero() {
            return Delivery::Cooldown(pending_cooldown);
        }

        let body = json!({ "embeds": [embed] });
        if self.options.dump_payloads {
            info!("{} {} payload: {}", method, url, body);
        }
        let request = WebhookRequest {
            method,
            url,
            body,
        };

        let first_wait = match self.attempt(base, request.clone(), wants_id).await {
            Classified::RateLimited(wait) => wait,
            other => return self.finish(base, other).await,
        };
        if first_wait > INLINE_RETRY_MAX {
            warn!(
                "Webhook rate limited for {:?}; cooling down destination",
                first_wait
            );
            self.limiters.webhook.set_cooldown(base, first_wait).await;
            return Delivery::Cooldown(first_wait);
        }

        debug!("Webhook 429, retrying once after {:?}", first_wait);
        sleep(first_wait).await;
        match self.attempt(base, request, wants_id).await {
            Classified::RateLimited(second_wait) => {
                let cooldown = first_wait.max(second_wait);
                warn!(
                    "Webhook rate limited again; cooling down destination for {:?}",
                    cooldown
                );
                self.limiters.webhook.set_cooldown(base, cooldown).await;
                Delivery::Cooldown(cooldown)
            }
            other => self.finish(base, other).await,
        }
    }

    async fn attempt(&self, base: &str, request: WebhookRequest, wants_id: bool) -> Classified {
        self.limiters.webhook.acquire(base).await;
        let what = format!("{} {}", request.method, base);
        match self.transport.send(request).await {
            Ok(response) => {
                let classified = classify(&response, wants_id);
                if classified == Classified::Failed {
                    warn!(
                        "Webhook {} failed (status {}): {}",
                        what, response.status, response.body
                    );
                }
                classified
            }
            Err(e) => {
                warn!("Webhook {} failed: {:#}", what, e);
                Classified::Failed
            }
        }
    }

    async fn finish(&self, base: &str, classified: Classified) -> Delivery {
        match classified {
            Classified::Success { message_id } => {
                self.settle().await;
                Delivery::Delivered(Receipt {
                    message_id,
                    webhook_base: base.to_string(),
                })
            }
            Classified::HardBlocked => {
                warn!("Edge rate limit hit on {}; stopping all webhook traffic", base);
                self.limiters.latch_hard_block();
                Delivery::HardBlocked
            }
            Classified::Failed => Delivery::Failed,
            Classified::RateLimited(wait) => Delivery::Cooldown(wait),
        }
    }

    async fn settle(&self) {
        let extra = if self.options.settle_jitter.is_zero() {
            Duration::ZERO
        } else {
            let max = self.options.settle_jitter.as_millis() as u64;
            Duration::from_millis(rand::thread_rng().gen_range(0..=max))
        };
        let pause = self.options.settle + extra;
        if !pause.is_zero() {
            sleep(pause).await;
        }
    }
}

//! [`ChatGateway`] – bounded conversation history, client-side rate limiting
//! and rate-limit retries in front of a [`ModelClient`].
//!
//! # History
//!
//! The system instruction is stored apart from the turn history and is sent
//! first on every request; it is never pruned. Turns are appended in
//! user/assistant pairs. After each reply, the oldest pairs are dropped while
//! the history holds more than [`GatewayConfig::history_limit`] turns, so the
//! history always starts with a user turn and alternates.
//!
//! # Retries
//!
//! A [`LlmError::RateLimited`] reply is retried after
//! [`GatewayConfig::retry_delay`], up to [`GatewayConfig::max_attempts`]
//! calls in total. Any other error is returned immediately. Each call is
//! bounded by [`GatewayConfig::response_timeout`]; expiry surfaces as
//! [`LlmError::Timeout`] and is not retried.
//!
//! The history is only updated once a reply arrives, so a failed or
//! cancelled `send` leaves it untouched.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use llmnav_hal::jpeg_data_uri;
use tracing::{debug, warn};

use crate::llm_driver::{ChatMessage, LlmError, ModelClient};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Token-bucket parameters for client-side throttling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// One request token is replenished every `period`.
    pub period: Duration,
    /// Bucket size.
    pub burst: u32,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(6),
            burst: 2,
        }
    }
}

/// Configuration bundle for [`ChatGateway`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Maximum number of user/assistant turns kept (minimum 2).
    pub history_limit: usize,
    /// Total number of calls per `send` when the provider keeps returning
    /// rate-limit errors (minimum 1).
    pub max_attempts: u32,
    /// Fixed wait between rate-limited attempts.
    pub retry_delay: Duration,
    /// `None` disables client-side throttling.
    pub rate_limit: Option<RateLimit>,
    /// Upper bound on a single model call; `None` waits indefinitely.
    pub response_timeout: Option<Duration>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            history_limit: 4,
            max_attempts: 3,
            retry_delay: Duration::from_secs(60),
            rate_limit: Some(RateLimit::default()),
            response_timeout: Some(Duration::from_secs(120)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ChatGateway
// ─────────────────────────────────────────────────────────────────────────────

/// Stateful wrapper around a [`ModelClient`].
pub struct ChatGateway {
    client: Arc<dyn ModelClient>,
    config: GatewayConfig,
    limiter: Option<DefaultDirectRateLimiter>,
    system_instruction: Option<String>,
    history: Vec<ChatMessage>,
}

impl std::fmt::Debug for ChatGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatGateway")
            .field("model", &self.client.model_name())
            .field("config", &self.config)
            .field("history_len", &self.history.len())
            .finish()
    }
}

impl ChatGateway {
    pub fn new(client: Arc<dyn ModelClient>, config: GatewayConfig) -> Self {
        let limiter = config.rate_limit.and_then(build_limiter);
        Self {
            client,
            config,
            limiter,
            system_instruction: None,
            history: Vec::new(),
        }
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    pub fn model_name(&self) -> &str {
        self.client.model_name()
    }

    pub fn system_instruction(&self) -> Option<&str> {
        self.system_instruction.as_deref()
    }

    /// Replace the system instruction and reset the history.
    pub fn set_system_instruction(&mut self, instruction: impl Into<String>) {
        self.system_instruction = Some(instruction.into());
        self.history.clear();
    }

    /// Remove the system instruction and reset the history.
    pub fn clear_system_instruction(&mut self) {
        self.system_instruction = None;
        self.history.clear();
    }

    /// Reset the history to just the system instruction.
    pub fn clear(&mut self) {
        self.history.clear();
    }

    /// Turn history, without the system instruction.
    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Full conversation as sent to the model.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.system_instruction
            .iter()
            .map(ChatMessage::system)
            .chain(self.history.iter().cloned())
            .collect()
    }

    /// Send a user turn, optionally with a base64-encoded JPEG, and return
    /// the assistant's reply.
    ///
    /// # Errors
    ///
    /// Returns the last [`LlmError::RateLimited`] once every attempt was
    /// rate limited, [`LlmError::Timeout`] when a call outlives
    /// `response_timeout`, or the first other error.
    pub async fn send(&mut self, prompt: &str, image_base64: Option<&str>) -> Result<String, LlmError> {
        let turn = match image_base64 {
            Some(image) => ChatMessage::user_with_image(prompt, jpeg_data_uri(image)),
            None => ChatMessage::user(prompt),
        };
        let mut messages = self.messages();
        messages.push(turn.clone());
        let max_attempts = self.config.max_attempts.max(1);

        let mut attempt = 1;
        let reply = loop {
            if let Some(limiter) = &self.limiter {
                limiter.until_ready().await;
            }
            match self.complete(&messages).await {
                Ok(reply) => break reply,
                Err(e) if e.is_rate_limit() && attempt < max_attempts => {
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = self.config.retry_delay.as_millis() as u64,
                        "model rate limited, retrying"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        self.history.push(turn);
        self.history.push(ChatMessage::assistant(reply.clone()));
        self.prune();
        debug!(attempts = attempt, history = self.history.len(), "model replied");
        Ok(reply)
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let call = self.client.complete(messages);
        match self.config.response_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .unwrap_or_else(|_| {
                    warn!(timeout_ms = limit.as_millis() as u64, "model call timed out");
                    Err(LlmError::Timeout(limit))
                }),
            None => call.await,
        }
    }

    fn prune(&mut self) {
        let limit = self.config.history_limit.max(2);
        while self.history.len() > limit && self.history.len() >= 2 {
            self.history.drain(..2);
        }
    }
}

fn build_limiter(rate: RateLimit) -> Option<DefaultDirectRateLimiter> {
    let burst = NonZeroU32::new(rate.burst.max(1))?;
    let quota = Quota::with_period(rate.period)?.allow_burst(burst);
    Some(RateLimiter::direct(quota))
}

#[cfg(test)]
mod tests {
    use crate::llm_driver::Role;
    use crate::scripted::{Reply, ScriptedModel};

    use super::*;

    fn fast_config() -> GatewayConfig {
        GatewayConfig {
            retry_delay: Duration::from_millis(1),
            rate_limit: None,
            ..GatewayConfig::default()
        }
    }

    fn gateway(model: &Arc<ScriptedModel>) -> ChatGateway {
        ChatGateway::new(model.clone(), fast_config()).with_system_instruction("system")
    }

    #[tokio::test]
    async fn retries_rate_limit_then_succeeds() {
        let model = Arc::new(
            ScriptedModel::new("m")
                .rate_limited()
                .rate_limited()
                .reply("ok"),
        );
        let mut chat = gateway(&model);
        assert_eq!(chat.send("hello", None).await.unwrap(), "ok");
        assert_eq!(model.calls(), 3);
        assert_eq!(chat.history().len(), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let model = Arc::new(ScriptedModel::new("m").then_repeat(Reply::RateLimited));
        let mut chat = gateway(&model);
        let err = chat.send("hello", None).await.unwrap_err();
        assert!(err.is_rate_limit());
        assert_eq!(model.calls(), 3);
        assert!(chat.history().is_empty(), "failed turn must be rolled back");
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let model = Arc::new(ScriptedModel::new("m").fail("boom").reply("never"));
        let mut chat = gateway(&model);
        assert!(matches!(
            chat.send("hello", None).await,
            Err(LlmError::BadResponse(_))
        ));
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn history_is_bounded_and_keeps_system_instruction() {
        let model = Arc::new(ScriptedModel::new("m").then_repeat(Reply::Text("ack".into())));
        let mut chat = gateway(&model);
        for i in 0..5 {
            chat.send(&format!("turn {i}"), None).await.unwrap();
        }
        let history = chat.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].text(), "turn 3");
        assert_eq!(history[3].role, Role::Assistant);

        let sent = model.requests();
        let last = sent.last().unwrap();
        assert_eq!(last[0].role, Role::System);
        assert_eq!(last[0].text(), "system");
    }

    #[tokio::test]
    async fn clear_keeps_only_system_instruction() {
        let model = Arc::new(ScriptedModel::new("m").reply("a"));
        let mut chat = gateway(&model);
        chat.send("hello", None).await.unwrap();
        chat.clear();
        assert!(chat.history().is_empty());
        assert_eq!(chat.messages().len(), 1);
        assert_eq!(chat.system_instruction(), Some("system"));
    }

    #[tokio::test]
    async fn image_is_sent_as_data_uri() {
        let model = Arc::new(ScriptedModel::new("m").reply("seen"));
        let mut chat = gateway(&model);
        chat.send("Current view:", Some("QUJD")).await.unwrap();
        let sent = &model.requests()[0];
        let user = &sent[1];
        assert!(user.has_image());
        let json = serde_json::to_value(user).unwrap();
        assert_eq!(json["content"][1]["image_url"]["url"], "data:image/jpeg;base64,QUJD");
    }

    #[tokio::test]
    async fn changing_system_instruction_resets_history() {
        let model = Arc::new(ScriptedModel::new("m").reply("a"));
        let mut chat = gateway(&model);
        chat.send("hello", None).await.unwrap();
        chat.set_system_instruction("new rules");
        assert!(chat.history().is_empty());
        assert_eq!(chat.system_instruction(), Some("new rules"));
        chat.clear_system_instruction();
        assert!(chat.messages().is_empty());
        assert_eq!(chat.model_name(), "m");
    }

    #[tokio::test]
    async fn burst_allows_immediate_requests() {
        let model = Arc::new(ScriptedModel::new("m").then_repeat(Reply::Text("ok".into())));
        let config = GatewayConfig {
            rate_limit: Some(RateLimit {
                period: Duration::from_secs(6),
                burst: 2,
            }),
            ..fast_config()
        };
        let mut chat = ChatGateway::new(model.clone(), config);
        let started = std::time::Instant::now();
        chat.send("one", None).await.unwrap();
        chat.send("two", None).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn limiter_spaces_requests_beyond_burst() {
        let model = Arc::new(ScriptedModel::new("m").then_repeat(Reply::Text("ok".into())));
        let period = Duration::from_millis(300);
        let config = GatewayConfig {
            rate_limit: Some(RateLimit { period, burst: 1 }),
            ..fast_config()
        };
        let mut chat = ChatGateway::new(model.clone(), config);
        let started = std::time::Instant::now();
        for turn in ["one", "two", "three"] {
            chat.send(turn, None).await.unwrap();
        }
        // The first call spends the burst; the other two wait a period each.
        assert!(started.elapsed() >= period * 2 - Duration::from_millis(20));
        assert_eq!(model.calls(), 3);
    }

    #[tokio::test]
    async fn slow_model_times_out_and_history_is_unchanged() {
        let model = Arc::new(
            ScriptedModel::new("m")
                .with_delay(Duration::from_secs(3600))
                .reply("too late"),
        );
        let config = GatewayConfig {
            response_timeout: Some(Duration::from_millis(50)),
            ..fast_config()
        };
        let mut chat = ChatGateway::new(model.clone(), config);
        let err = chat.send("hello", None).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(model.calls(), 1);
        assert!(chat.history().is_empty());
    }

    #[tokio::test]
    async fn cancelled_send_leaves_history_untouched() {
        let model = Arc::new(
            ScriptedModel::new("m")
                .with_delay(Duration::from_secs(3600))
                .reply("too late"),
        );
        let mut chat = ChatGateway::new(model.clone(), fast_config());
        let pending = tokio::time::timeout(Duration::from_millis(50), chat.send("hello", None)).await;
        assert!(pending.is_err());
        assert!(chat.history().is_empty());
    }

    #[test]
    fn limiter_rejects_zero_period() {
        assert!(
            build_limiter(RateLimit {
                period: Duration::ZERO,
                burst: 2
            })
            .is_none()
        );
    }
}

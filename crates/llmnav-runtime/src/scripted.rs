//! [`ScriptedModel`] – an in-process [`ModelClient`] that plays back a fixed
//! script of replies.
//!
//! Used for headless dry runs and as the model double in tests. Every
//! request is recorded so callers can inspect what the gateway sent.
//!
//! # Example
//!
//! ```rust
//! use llmnav_runtime::scripted::ScriptedModel;
//!
//! let model = ScriptedModel::new("scripted")
//!     .rate_limited()
//!     .reply(r#"{"goal":"g","scene_description":"s","action":{"command":"COMPLETE","parameters":0}}"#);
//! assert_eq!(model.remaining(), 2);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::llm_driver::{ChatMessage, LlmError, ModelClient};

/// One scripted model turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Return this text.
    Text(String),
    /// Fail with [`LlmError::RateLimited`].
    RateLimited,
    /// Fail with [`LlmError::BadResponse`] carrying this message.
    Fail(String),
}

impl Reply {
    fn produce(self) -> Result<String, LlmError> {
        match self {
            Reply::Text(text) => Ok(text),
            Reply::RateLimited => Err(LlmError::RateLimited("scripted rate limit".into())),
            Reply::Fail(msg) => Err(LlmError::BadResponse(msg)),
        }
    }
}

/// Plays back queued [`Reply`] values in order, then falls back to a
/// repeated reply if one is set.
#[derive(Debug)]
pub struct ScriptedModel {
    name: String,
    script: Mutex<VecDeque<Reply>>,
    fallback: Option<Reply>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            fallback: None,
            delay: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(self, text: impl Into<String>) -> Self {
        self.push(Reply::Text(text.into()))
    }

    pub fn rate_limited(self) -> Self {
        self.push(Reply::RateLimited)
    }

    pub fn fail(self, message: impl Into<String>) -> Self {
        self.push(Reply::Fail(message.into()))
    }

    /// Reply used once the script is exhausted.
    pub fn then_repeat(mut self, reply: Reply) -> Self {
        self.fallback = Some(reply);
        self
    }

    /// Sleep this long before answering each request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of `complete` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Scripted replies not yet consumed.
    pub fn remaining(&self) -> usize {
        lock(&self.script).len()
    }

    /// Snapshot of every conversation sent so far, oldest first.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        lock(&self.requests).clone()
    }

    fn push(self, reply: Reply) -> Self {
        lock(&self.script).push_back(reply);
        self
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn model_name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.requests).push(messages.to_vec());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = lock(&self.script).pop_front().or_else(|| self.fallback.clone());
        match next {
            Some(reply) => reply.produce(),
            None => Err(LlmError::BadResponse("script exhausted".into())),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

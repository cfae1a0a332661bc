//! Message delivery to webhook destinations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use adpulse_storage::{
    classify_status, retry_with_backoff, BackoffPolicy, HttpClient, HttpError, RetryDisposition,
};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("destination is rate limiting requests")]
    RateLimited,
    #[error("destination answered HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error(transparent)]
    Http(#[from] HttpError),
}

impl DeliveryError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited)
    }
}

/// Sends one text message to one destination.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, text: &str, destination: &str) -> Result<(), DeliveryError>;
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    text: &'a str,
}

/// Incoming-webhook notifier posting `{"text": ...}`.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    http: HttpClient,
}

impl WebhookNotifier {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, text: &str, destination: &str) -> Result<(), DeliveryError> {
        let resp = self
            .http
            .post_json("webhook", destination, &WebhookPayload { text })
            .await?;
        if resp.is_success() {
            debug!(status = resp.status.as_u16(), "message delivered");
            return Ok(());
        }
        if classify_status(resp.status) == RetryDisposition::Retryable {
            return Err(DeliveryError::RateLimited);
        }
        let body = resp.text();
        warn!(status = %resp.status, body = %body, "webhook rejected message");
        Err(DeliveryError::Rejected {
            status: resp.status.as_u16(),
            body,
        })
    }
}

/// Keeps messages in memory instead of sending them. Optionally answers the
/// first N sends with a rate-limit failure.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<SentMessage>>,
    rate_limit_remaining: AtomicUsize,
    reject_destinations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SentMessage {
    pub destination: String,
    pub text: String,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rate_limited_for(self, sends: usize) -> Self {
        self.rate_limit_remaining.store(sends, Ordering::SeqCst);
        self
    }

    pub fn rejecting(mut self, destination: impl Into<String>) -> Self {
        self.reject_destinations.push(destination.into());
        self
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn sent_to(&self, destination: &str) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|m| m.destination == destination)
            .map(|m| m.text)
            .collect()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn send(&self, text: &str, destination: &str) -> Result<(), DeliveryError> {
        let limited = self
            .rate_limit_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if limited {
            return Err(DeliveryError::RateLimited);
        }
        if self.reject_destinations.iter().any(|d| d == destination) {
            return Err(DeliveryError::Rejected {
                status: 404,
                body: "no_service".to_string(),
            });
        }
        info!(destination, text, "message captured");
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(SentMessage {
                destination: destination.to_string(),
                text: text.to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryResult {
    Delivered { attempts: usize },
    Failed { attempts: usize, reason: String },
}

impl DeliveryResult {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// Notifier plus retry policy. Only rate-limit failures are retried.
#[derive(Clone)]
pub struct Dispatcher {
    notifier: Arc<dyn Notifier>,
    policy: BackoffPolicy,
}

impl Dispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, policy: BackoffPolicy) -> Self {
        Self { notifier, policy }
    }

    pub fn notifier(&self) -> Arc<dyn Notifier> {
        self.notifier.clone()
    }

    pub fn notifier_name(&self) -> &'static str {
        self.notifier.name()
    }

    pub async fn dispatch(&self, message: &str, destination: &str) -> DeliveryResult {
        let mut attempts = 0;
        let outcome = retry_with_backoff(
            &self.policy,
            "dispatch",
            DeliveryError::is_rate_limited,
            |attempt| {
                attempts = attempt + 1;
                self.notifier.send(message, destination)
            },
        )
        .await;

        match outcome {
            Ok(()) => DeliveryResult::Delivered { attempts },
            Err(err) => {
                warn!(attempts, error = %err, "delivery abandoned");
                DeliveryResult::Failed {
                    attempts,
                    reason: err.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn quick() -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter_ratio: 0.1,
        }
    }

    #[tokio::test]
    async fn rate_limits_are_retried_until_delivered() {
        let notifier = Arc::new(MemoryNotifier::new().rate_limited_for(2));
        let dispatcher = Dispatcher::new(notifier.clone(), quick());

        let result = dispatcher.dispatch("oi", "https://hooks.example.test/a").await;
        assert_eq!(result, DeliveryResult::Delivered { attempts: 3 });
        assert_eq!(notifier.sent_to("https://hooks.example.test/a"), vec!["oi"]);
    }

    #[tokio::test]
    async fn exhausted_rate_limit_is_a_failure() {
        let notifier = Arc::new(MemoryNotifier::new().rate_limited_for(10));
        let dispatcher = Dispatcher::new(notifier.clone(), quick());

        let result = dispatcher.dispatch("oi", "dest").await;
        assert!(!result.is_delivered());
        assert!(matches!(result, DeliveryResult::Failed { attempts: 4, .. }));
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn other_failures_are_not_retried() {
        let notifier = Arc::new(MemoryNotifier::new().rejecting("gone"));
        let dispatcher = Dispatcher::new(notifier, quick());

        let result = dispatcher.dispatch("oi", "gone").await;
        match result {
            DeliveryResult::Failed { attempts, reason } => {
                assert_eq!(attempts, 1);
                assert!(reason.contains("404"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

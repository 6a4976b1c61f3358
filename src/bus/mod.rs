//! In-process topic bus.
//!
//! Topics are exact strings; the single special subscription `"*"` receives
//! every publication. Any other pattern-looking string (`"command.*.v1"`) is
//! treated literally and will match nothing. Delivery is sequential in
//! subscription order, exact-topic subscribers before wildcard subscribers;
//! a failing handler is logged and skipped, never unsubscribed, and never
//! blocks delivery to the rest.
//!
//! Handlers must stay short. A handler that awaits agent-internal locks can
//! deadlock a publisher that holds them, so agent subscribers validate the
//! payload and hand it to an inbox channel instead of acting in place.

pub mod message;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use thiserror::Error;
use tracing::{debug, warn};

pub use message::{topic, BuildStatus, MapReport, Message, Payload, Target};

#[derive(Debug, Error)]
pub enum HandlerError {
    /// The payload failed the subscriber's shape or content checks.
    #[error("invalid message: {0}")]
    Validation(String),
    /// The subscriber accepted the message but failed to process it.
    #[error("handler failed: {0}")]
    Internal(String),
}

type Handler = Arc<dyn Fn(Message) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

struct Subscriber {
    name: String,
    handler: Handler,
}

/// Exact-topic publish/subscribe with one wildcard.
pub struct MessageBus {
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler for a topic. `name` identifies the subscriber in
    /// logs. Subscriptions are permanent for the life of the bus.
    pub fn subscribe<F, Fut>(&self, topic: &str, name: &str, handler: F)
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let subscriber = Subscriber {
            name: name.to_string(),
            handler: Arc::new(move |msg| Box::pin(handler(msg))),
        };
        self.subscribers
            .write()
            .expect("bus subscriber table poisoned")
            .entry(topic.to_string())
            .or_default()
            .push(subscriber);
        debug!(topic, subscriber = name, "subscribed");
    }

    /// Deliver a message to the topic's subscribers, then to wildcard
    /// subscribers. Returns how many handlers ran without error.
    pub async fn publish(&self, topic: &str, message: Message) -> usize {
        let handlers: Vec<(String, Handler)> = {
            let subs = self
                .subscribers
                .read()
                .expect("bus subscriber table poisoned");
            let mut out = Vec::new();
            if let Some(list) = subs.get(topic) {
                out.extend(list.iter().map(|s| (s.name.clone(), Arc::clone(&s.handler))));
            }
            if topic != message::topic::WILDCARD {
                if let Some(list) = subs.get(message::topic::WILDCARD) {
                    out.extend(list.iter().map(|s| (s.name.clone(), Arc::clone(&s.handler))));
                }
            }
            out
        };

        let mut delivered = 0usize;
        for (name, handler) in handlers {
            match handler(message.clone()).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(topic, subscriber = %name, error = %err, "handler rejected message");
                }
            }
        }
        delivered
    }

    /// Number of subscriptions on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers
            .read()
            .expect("bus subscriber table poisoned")
            .get(topic)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Message Bus - in-process publish/subscribe and request/reply
//!
//! Delivery is synchronous: `publish` invokes every subscriber of the topic,
//! in registration order, on the publisher's thread. Requests run their
//! handler on the blocking pool and are bounded by a timeout.
//!
//! ```text
//! publish(topic) ──▶ sticky cache (if sticky) ──▶ S1 ──▶ S2 ──▶ ... (errors/panics isolated)
//! request(topic) ──▶ handler on blocking pool ──▶ Reply | "timeout" | "no_handler"
//! ```
//!
//! Locks guard only the registries (subscriptions, sticky cache, request
//! handlers) and are never held while a handler runs, so handlers may
//! publish, subscribe or unsubscribe from inside a delivery.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::config::{env_flag, BusConfig, BUS_TRACE_ENV};
use crate::domain::envelope::{Envelope, MessageId};
use crate::domain::reply::Reply;
use crate::domain::topics::is_valid_topic;
use crate::infrastructure::panic::panic_message;

/// Subscriber callback
pub type SubscriberFn = dyn Fn(&Envelope) -> anyhow::Result<()> + Send + Sync;

/// Request handler callback
pub type RequestHandlerFn = dyn Fn(&Envelope) -> anyhow::Result<Reply> + Send + Sync;

/// `target` stamped on request envelopes
pub const REQUEST_TARGET: &str = "request";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Contract violations reported synchronously to the caller
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Invalid topic '{0}'")]
    InvalidTopic(String),

    #[error("A request handler is already registered for '{0}'")]
    HandlerAlreadyRegistered(String),

    #[error("Payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),
}

struct Subscription {
    id: SubscriptionId,
    topic: String,
    handler: Arc<SubscriberFn>,
    /// Cleared on unsubscribe; checked right before every invocation
    active: AtomicBool,
}

#[derive(Default)]
struct SubscriptionTable {
    by_topic: HashMap<String, Vec<Arc<Subscription>>>,
    topic_of: HashMap<SubscriptionId, String>,
}

impl SubscriptionTable {
    fn insert(&mut self, subscription: Arc<Subscription>) {
        self.topic_of
            .insert(subscription.id, subscription.topic.clone());
        self.by_topic
            .entry(subscription.topic.clone())
            .or_default()
            .push(subscription);
    }

    fn remove(&mut self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        let topic = self.topic_of.remove(&id)?;
        let subscribers = self.by_topic.get_mut(&topic)?;
        let index = subscribers.iter().position(|sub| sub.id == id)?;
        let removed = subscribers.remove(index);
        if subscribers.is_empty() {
            self.by_topic.remove(&topic);
        }
        Some(removed)
    }

    fn snapshot(&self, topic: &str) -> Vec<Arc<Subscription>> {
        self.by_topic.get(topic).cloned().unwrap_or_default()
    }
}

#[derive(Default)]
struct StickyState {
    topics: HashSet<String>,
    cache: HashMap<String, Arc<Envelope>>,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    handler_errors: AtomicU64,
    requests: AtomicU64,
    request_timeouts: AtomicU64,
    request_failures: AtomicU64,
    no_handler: AtomicU64,
}

/// Point-in-time copy of the bus counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusCounters {
    pub published: u64,
    pub delivered: u64,
    pub handler_errors: u64,
    pub requests: u64,
    pub request_timeouts: u64,
    pub request_failures: u64,
    pub no_handler: u64,
}

/// Diagnostics snapshot served on `runtime.bus.report.request`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusReport {
    /// Subscriber count per topic
    pub topics: BTreeMap<String, usize>,
    pub sticky_topics: Vec<String>,
    /// Sticky topics that currently hold a cached envelope
    pub cached_topics: Vec<String>,
    pub handler_topics: Vec<String>,
    pub trace: bool,
    pub counters: BusCounters,
}

/// In-process message bus
pub struct MessageBus {
    config: BusConfig,
    trace: AtomicBool,
    subscriptions: RwLock<SubscriptionTable>,
    sticky: RwLock<StickyState>,
    handlers: RwLock<HashMap<String, Arc<RequestHandlerFn>>>,
    counters: Counters,
}

impl MessageBus {
    /// Create a bus. Trace mode is on if the config asks for it or
    /// `CONDUIT_BUS_TRACE` is set.
    pub fn new(config: BusConfig) -> Self {
        let trace = config.trace || env_flag(BUS_TRACE_ENV).unwrap_or(false);
        let sticky = StickyState {
            topics: config.sticky_topics.iter().cloned().collect(),
            cache: HashMap::new(),
        };
        Self {
            config,
            trace: AtomicBool::new(trace),
            subscriptions: RwLock::new(SubscriptionTable::default()),
            sticky: RwLock::new(sticky),
            handlers: RwLock::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Create a bus with the default configuration
    pub fn with_defaults() -> Self {
        Self::new(BusConfig::default())
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn set_trace(&self, enabled: bool) {
        self.trace.store(enabled, Ordering::Relaxed);
    }

    pub fn trace_enabled(&self) -> bool {
        self.trace.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Publish / subscribe
    // ------------------------------------------------------------------

    /// Register a subscriber for every future publish on `topic`.
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Result<SubscriptionId, BusError>
    where
        F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add_subscription(topic, Arc::new(handler), false)
    }

    /// Like [`subscribe`](Self::subscribe), and immediately replay the cached
    /// envelope of a sticky topic, if there is one.
    pub fn subscribe_with_replay<F>(&self, topic: &str, handler: F) -> Result<SubscriptionId, BusError>
    where
        F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add_subscription(topic, Arc::new(handler), true)
    }

    fn add_subscription(
        &self,
        topic: &str,
        handler: Arc<SubscriberFn>,
        replay: bool,
    ) -> Result<SubscriptionId, BusError> {
        ensure_topic(topic)?;
        let subscription = Arc::new(Subscription {
            id: SubscriptionId::new(),
            topic: topic.to_string(),
            handler,
            active: AtomicBool::new(true),
        });

        // The replay is delivered before the subscription becomes visible.
        // Registration happens under the sticky lock and only if the cache
        // still holds the envelope just replayed; otherwise the newer one is
        // replayed first.
        let mut replayed: Option<MessageId> = None;
        loop {
            let pending = {
                let sticky = self.sticky.read();
                let cached = if replay { sticky.cache.get(topic).cloned() } else { None };
                match cached {
                    Some(envelope) if Some(envelope.msg_id()) != replayed => Some(envelope),
                    _ => {
                        self.subscriptions.write().insert(subscription.clone());
                        None
                    }
                }
            };
            let Some(envelope) = pending else {
                break;
            };
            debug!(topic = %topic, msg_id = %envelope.msg_id(), "Replaying sticky envelope");
            self.deliver(&subscription, &envelope);
            replayed = Some(envelope.msg_id());
        }

        if self.trace_enabled() {
            info!(
                target: "conduit::bus::trace",
                topic = %topic,
                subscription_id = %subscription.id,
                replay,
                "subscribe"
            );
        }

        Ok(subscription.id)
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    ///
    /// A delivery already running in the handler completes; no delivery
    /// starts after this returns.
    pub fn unsubscribe(&self, subscription_id: SubscriptionId) -> bool {
        let removed = self.subscriptions.write().remove(subscription_id);
        match removed {
            Some(subscription) => {
                subscription.active.store(false, Ordering::Release);
                if self.trace_enabled() {
                    info!(
                        target: "conduit::bus::trace",
                        topic = %subscription.topic,
                        subscription_id = %subscription_id,
                        "unsubscribe"
                    );
                }
                true
            }
            None => false,
        }
    }

    /// Publish to every current subscriber of `topic`.
    ///
    /// Subscriber failures are logged and never reach the publisher. The only
    /// error is an invalid topic.
    pub fn publish(
        &self,
        topic: &str,
        payload: Value,
        source: &str,
        trace_id: Option<&str>,
    ) -> Result<Arc<Envelope>, BusError> {
        self.publish_inner(topic, payload, source, trace_id, false)
    }

    /// Publish and cache the envelope even if `topic` was not configured
    /// sticky; the topic stays sticky afterwards.
    pub fn publish_sticky(
        &self,
        topic: &str,
        payload: Value,
        source: &str,
        trace_id: Option<&str>,
    ) -> Result<Arc<Envelope>, BusError> {
        self.publish_inner(topic, payload, source, trace_id, true)
    }

    /// Serialize a typed payload and publish it.
    pub fn publish_event<T: Serialize>(
        &self,
        topic: &str,
        event: &T,
        source: &str,
    ) -> Result<Arc<Envelope>, BusError> {
        let payload = serde_json::to_value(event)?;
        self.publish(topic, payload, source, None)
    }

    fn publish_inner(
        &self,
        topic: &str,
        payload: Value,
        source: &str,
        trace_id: Option<&str>,
        force_sticky: bool,
    ) -> Result<Arc<Envelope>, BusError> {
        ensure_topic(topic)?;
        let envelope = Arc::new(
            Envelope::new(topic, payload, source).with_trace_id(trace_id.map(str::to_owned)),
        );

        let is_sticky = force_sticky || self.sticky.read().topics.contains(topic);
        let subscribers = if is_sticky {
            let mut sticky = self.sticky.write();
            sticky.topics.insert(topic.to_string());
            sticky.cache.insert(topic.to_string(), envelope.clone());
            self.subscriptions.read().snapshot(topic)
        } else {
            self.subscriptions.read().snapshot(topic)
        };

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("conduit_bus_published_total").increment(1);

        if self.trace_enabled() {
            info!(
                target: "conduit::bus::trace",
                topic = %topic,
                msg_id = %envelope.msg_id(),
                source = %source,
                sticky = is_sticky,
                subscribers = subscribers.len(),
                payload = %envelope.payload(),
                "publish"
            );
        }

        if subscribers.is_empty() {
            debug!(topic = %topic, "No subscribers listening to topic");
        }
        for subscription in &subscribers {
            self.deliver(subscription, &envelope);
        }

        Ok(envelope)
    }

    fn deliver(&self, subscription: &Subscription, envelope: &Envelope) {
        if !subscription.active.load(Ordering::Acquire) {
            return;
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (subscription.handler)(envelope)));
        match outcome {
            Ok(Ok(())) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                self.record_handler_error();
                error!(
                    topic = %envelope.topic(),
                    subscription_id = %subscription.id,
                    error = %format!("{e:#}"),
                    "Subscriber handler failed"
                );
            }
            Err(payload) => {
                self.record_handler_error();
                error!(
                    topic = %envelope.topic(),
                    subscription_id = %subscription.id,
                    panic = %panic_message(payload.as_ref()),
                    "Subscriber handler panicked"
                );
            }
        }
    }

    fn record_handler_error(&self) {
        self.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("conduit_bus_handler_errors_total").increment(1);
    }

    // ------------------------------------------------------------------
    // Sticky cache
    // ------------------------------------------------------------------

    pub fn mark_sticky(&self, topic: &str) -> Result<(), BusError> {
        ensure_topic(topic)?;
        self.sticky.write().topics.insert(topic.to_string());
        Ok(())
    }

    pub fn is_sticky(&self, topic: &str) -> bool {
        self.sticky.read().topics.contains(topic)
    }

    /// Latest envelope cached for a sticky topic
    pub fn sticky(&self, topic: &str) -> Option<Arc<Envelope>> {
        self.sticky.read().cache.get(topic).cloned()
    }

    /// Drop the cached envelope; the topic stays sticky.
    pub fn clear_sticky(&self, topic: &str) -> Option<Arc<Envelope>> {
        self.sticky.write().cache.remove(topic)
    }

    // ------------------------------------------------------------------
    // Request / reply
    // ------------------------------------------------------------------

    /// Bind the request handler for `topic`.
    ///
    /// A second registration replaces the first with a warning, unless
    /// `reject_duplicate_handlers` is configured.
    pub fn register_handler<F>(&self, topic: &str, handler: F) -> Result<(), BusError>
    where
        F: Fn(&Envelope) -> anyhow::Result<Reply> + Send + Sync + 'static,
    {
        ensure_topic(topic)?;
        let mut handlers = self.handlers.write();
        if handlers.contains_key(topic) {
            if self.config.reject_duplicate_handlers {
                return Err(BusError::HandlerAlreadyRegistered(topic.to_string()));
            }
            warn!(topic = %topic, "Replacing existing request handler");
        }
        handlers.insert(topic.to_string(), Arc::new(handler));
        Ok(())
    }

    pub fn unregister_handler(&self, topic: &str) -> bool {
        self.handlers.write().remove(topic).is_some()
    }

    pub fn has_handler(&self, topic: &str) -> bool {
        self.handlers.read().contains_key(topic)
    }

    /// Invoke the handler bound to `topic` and wait at most `timeout`.
    ///
    /// Always resolves to a [`Reply`]: `no_handler` when nothing is bound,
    /// `timeout` when the handler is too slow, the error text when it fails.
    pub async fn request(&self, topic: &str, payload: Value, source: &str, timeout: Duration) -> Reply {
        self.request_traced(topic, payload, source, timeout, None).await
    }

    /// [`request`](Self::request) with `bus.default_request_timeout`
    pub async fn request_with_default_timeout(&self, topic: &str, payload: Value, source: &str) -> Reply {
        let timeout = self.config.default_request_timeout;
        self.request_traced(topic, payload, source, timeout, None).await
    }

    pub async fn request_traced(
        &self,
        topic: &str,
        payload: Value,
        source: &str,
        timeout: Duration,
        trace_id: Option<&str>,
    ) -> Reply {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        if !is_valid_topic(topic) {
            self.counters.request_failures.fetch_add(1, Ordering::Relaxed);
            return self.finish_request(topic, "invalid_topic", Reply::error(Reply::INVALID_TOPIC));
        }

        let handler = self.handlers.read().get(topic).cloned();
        let Some(handler) = handler else {
            self.counters.no_handler.fetch_add(1, Ordering::Relaxed);
            return self.finish_request(topic, "no_handler", Reply::error(Reply::NO_HANDLER));
        };

        let envelope = Envelope::new(topic, payload, source)
            .with_target(Some(REQUEST_TARGET.to_string()))
            .with_trace_id(trace_id.map(str::to_owned));

        if self.trace_enabled() {
            info!(
                target: "conduit::bus::trace",
                topic = %topic,
                msg_id = %envelope.msg_id(),
                source = %source,
                timeout_ms = timeout.as_millis() as u64,
                payload = %envelope.payload(),
                "request"
            );
        }

        let started = Instant::now();
        let task = tokio::task::spawn_blocking(move || handler(&envelope));

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(reply))) => {
                if !reply.ok {
                    self.counters.request_failures.fetch_add(1, Ordering::Relaxed);
                }
                let outcome = if reply.ok { "ok" } else { "error" };
                self.finish_request(topic, outcome, reply)
            }
            Ok(Ok(Err(e))) => {
                self.counters.request_failures.fetch_add(1, Ordering::Relaxed);
                let message = format!("{e:#}");
                warn!(topic = %topic, error = %message, "Request handler returned an error");
                self.finish_request(topic, "error", Reply::error(message))
            }
            Ok(Err(join_error)) => {
                self.counters.request_failures.fetch_add(1, Ordering::Relaxed);
                let message = if join_error.is_panic() {
                    format!("handler_panicked: {}", panic_message(join_error.into_panic().as_ref()))
                } else {
                    "handler_cancelled".to_string()
                };
                error!(topic = %topic, error = %message, "Request handler did not complete");
                self.finish_request(topic, "error", Reply::error(message))
            }
            Err(_elapsed) => {
                self.counters.request_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    topic = %topic,
                    timeout_ms = timeout.as_millis() as u64,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Request timed out"
                );
                self.finish_request(topic, "timeout", Reply::error(Reply::TIMEOUT))
            }
        }
    }

    fn finish_request(&self, topic: &str, outcome: &'static str, reply: Reply) -> Reply {
        metrics::counter!("conduit_bus_requests_total", "outcome" => outcome).increment(1);
        if self.trace_enabled() {
            info!(
                target: "conduit::bus::trace",
                topic = %topic,
                ok = reply.ok,
                error = ?reply.error,
                "reply"
            );
        }
        reply
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscriptions
            .read()
            .by_topic
            .get(topic)
            .map_or(0, Vec::len)
    }

    pub fn counters(&self) -> BusCounters {
        let c = &self.counters;
        BusCounters {
            published: c.published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            handler_errors: c.handler_errors.load(Ordering::Relaxed),
            requests: c.requests.load(Ordering::Relaxed),
            request_timeouts: c.request_timeouts.load(Ordering::Relaxed),
            request_failures: c.request_failures.load(Ordering::Relaxed),
            no_handler: c.no_handler.load(Ordering::Relaxed),
        }
    }

    pub fn report(&self) -> BusReport {
        let topics = self
            .subscriptions
            .read()
            .by_topic
            .iter()
            .map(|(topic, subscribers)| (topic.clone(), subscribers.len()))
            .collect();

        let (mut sticky_topics, mut cached_topics) = {
            let sticky = self.sticky.read();
            (
                sticky.topics.iter().cloned().collect::<Vec<_>>(),
                sticky.cache.keys().cloned().collect::<Vec<_>>(),
            )
        };
        sticky_topics.sort();
        cached_topics.sort();

        let mut handler_topics: Vec<String> = self.handlers.read().keys().cloned().collect();
        handler_topics.sort();

        BusReport {
            topics,
            sticky_topics,
            cached_topics,
            handler_topics,
            trace: self.trace_enabled(),
            counters: self.counters(),
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("trace", &self.trace_enabled())
            .field("counters", &self.counters())
            .finish_non_exhaustive()
    }
}

fn ensure_topic(topic: &str) -> Result<(), BusError> {
    if is_valid_topic(topic) {
        Ok(())
    } else {
        Err(BusError::InvalidTopic(topic.to_string()))
    }
}

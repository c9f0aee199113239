//! Ordered incoming and outgoing middleware chains.
//!
//! Every event passes through the chain matching its direction before it is
//! handed to the [`EventDispatcher`]. Chains can change at any time; a send works
//! on a snapshot taken when it starts.

use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use opentelemetry::metrics::Counter;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::{HostError, HostResult};
use crate::event::{Direction, Event, parse_event, validate_event};
use crate::logger::IO_TARGET;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewareFlow {
    Continue,
    /// Stops the chain; the event is not dispatched.
    Halt,
}

#[async_trait]
pub trait MiddlewareHandler: Send + Sync {
    async fn handle(&self, event: &mut Event) -> anyhow::Result<MiddlewareFlow>;
}

/// Receives events that made it through their chain (the bot runtime, or the
/// channel connectors for outgoing events).
#[async_trait]
pub trait EventDispatcher: Send + Sync {
    async fn dispatch(&self, event: Event) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct MiddlewareDefinition {
    pub name: String,
    pub direction: Direction,
    pub order: i32,
    pub enabled: bool,
    pub timeout: Option<Duration>,
    pub description: String,
    pub handler: Arc<dyn MiddlewareHandler>,
}

impl MiddlewareDefinition {
    pub fn new(
        name: impl Into<String>,
        direction: Direction,
        description: impl Into<String>,
        handler: Arc<dyn MiddlewareHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            direction,
            order: 0,
            enabled: true,
            timeout: None,
            description: description.into(),
            handler,
        }
    }

    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    fn validate(&self) -> HostResult<()> {
        let invalid = |field: &str, reason: &str| Err(HostError::validation("middleware", field, reason));
        if self.name.trim().is_empty() {
            return invalid("name", "is required");
        }
        if self.description.trim().is_empty() {
            return invalid("description", "is required");
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return invalid("timeout", "must be greater than zero");
        }
        Ok(())
    }
}

impl fmt::Debug for MiddlewareDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareDefinition")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("order", &self.order)
            .field("enabled", &self.enabled)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Dispatched,
    Halted { by: String },
}

type Chain = RwLock<Vec<Arc<MiddlewareDefinition>>>;

pub struct EventEngine {
    is_production: bool,
    incoming: Chain,
    outgoing: Chain,
    dispatcher: Arc<dyn EventDispatcher>,
    processed: Counter<u64>,
}

impl EventEngine {
    /// Envelopes are validated unless `is_production` is set.
    pub fn new(is_production: bool, dispatcher: Arc<dyn EventDispatcher>) -> Self {
        let processed = opentelemetry::global::meter("bothost")
            .u64_counter("events_processed")
            .with_description("Events that went through a middleware chain")
            .build();
        Self {
            is_production,
            incoming: RwLock::new(Vec::new()),
            outgoing: RwLock::new(Vec::new()),
            dispatcher,
            processed,
        }
    }

    fn chain(&self, direction: Direction) -> &Chain {
        match direction {
            Direction::Incoming => &self.incoming,
            Direction::Outgoing => &self.outgoing,
        }
    }

    pub fn register(&self, definition: MiddlewareDefinition) -> HostResult<()> {
        definition.validate()?;
        let mut chain = self
            .chain(definition.direction)
            .write()
            .map_err(|_| anyhow::anyhow!("middleware chain lock poisoned"))?;
        if chain.iter().any(|m| m.name == definition.name) {
            return Err(HostError::validation(
                "middleware",
                "name",
                format!("`{}` is already registered for {} events", definition.name, definition.direction),
            ));
        }
        debug!(name = %definition.name, direction = %definition.direction, order = definition.order, "middleware registered");
        chain.push(Arc::new(definition));
        // stable: equal orders keep registration order
        chain.sort_by_key(|m| m.order);
        Ok(())
    }

    /// Registers each definition in turn, stopping at the first invalid one.
    pub fn register_all(&self, definitions: impl IntoIterator<Item = MiddlewareDefinition>) -> HostResult<()> {
        definitions.into_iter().try_for_each(|d| self.register(d))
    }

    pub fn unregister(&self, name: &str) {
        for direction in [Direction::Incoming, Direction::Outgoing] {
            if let Ok(mut chain) = self.chain(direction).write() {
                chain.retain(|m| m.name != name);
            }
        }
    }

    /// Names of the registered middleware in execution order.
    pub fn list(&self, direction: Direction) -> Vec<String> {
        self.snapshot(direction)
            .iter()
            .map(|m| m.name.clone())
            .collect()
    }

    fn snapshot(&self, direction: Direction) -> Vec<Arc<MiddlewareDefinition>> {
        self.chain(direction)
            .read()
            .map(|chain| chain.clone())
            .unwrap_or_default()
    }

    pub async fn send_event(&self, event: Event) -> HostResult<SendOutcome> {
        if !self.is_production {
            let value = serde_json::to_value(&event).map_err(anyhow::Error::from)?;
            validate_event(&value)?;
        }
        self.process(event).await
    }

    /// Entry point for envelopes arriving as JSON over the wire.
    pub async fn send_raw_event(&self, value: Value) -> HostResult<SendOutcome> {
        let event = parse_event(value, self.is_production)?;
        self.process(event).await
    }

    async fn process(&self, mut event: Event) -> HostResult<SendOutcome> {
        let direction = event.direction;
        for middleware in self.snapshot(direction).iter().filter(|m| m.enabled) {
            let run = middleware.handler.handle(&mut event);
            let flow = match middleware.timeout {
                Some(limit) => match tokio::time::timeout(limit, run).await {
                    Ok(flow) => flow,
                    Err(_) => {
                        warn!(name = %middleware.name, "middleware timed out");
                        return Err(HostError::MiddlewareTimeout {
                            name: middleware.name.clone(),
                            timeout_ms: limit.as_millis() as u64,
                        });
                    }
                },
                None => run.await,
            }
            .map_err(|e| HostError::Middleware {
                name: middleware.name.clone(),
                reason: format!("{e:#}"),
            })?;

            if flow == MiddlewareFlow::Halt {
                debug!(name = %middleware.name, id = %event.id, "event halted by middleware");
                self.record(&event, "halted");
                return Ok(SendOutcome::Halted {
                    by: middleware.name.clone(),
                });
            }
        }

        self.record(&event, "dispatched");
        self.dispatcher.dispatch(event).await?;
        Ok(SendOutcome::Dispatched)
    }

    fn record(&self, event: &Event, outcome: &'static str) {
        self.processed.add(
            1,
            &[
                KeyValue::new("direction", event.direction.as_str()),
                KeyValue::new("outcome", outcome),
            ],
        );
        info!(
            target: IO_TARGET,
            id = %event.id,
            bot_id = %event.bot_id,
            channel = %event.channel,
            direction = %event.direction,
            event_type = %event.event_type,
            outcome,
            "event processed"
        );
    }

    /// Sends one outgoing event per payload, in order, replying to `destination`.
    pub async fn reply_to_event(
        &self,
        destination: &Event,
        payloads: Vec<Value>,
        incoming_event_id: Option<&str>,
    ) -> HostResult<()> {
        for payload in payloads {
            let mut reply = Event::new(
                destination.bot_id.clone(),
                destination.channel.clone(),
                destination.target.clone(),
                Direction::Outgoing,
                payload,
            );
            reply.thread_id = destination.thread_id.clone();
            reply.incoming_event_id = incoming_event_id.map(str::to_string);
            if !reply.payload.is_object() {
                reply.payload = json!({ "type": reply.event_type, "value": reply.payload });
            }
            self.send_event(reply).await?;
        }
        Ok(())
    }
}

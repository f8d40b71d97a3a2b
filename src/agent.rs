// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Agent
//!
//! The [`ConsumerAgent`] passes messages between a [`Broker`] and a [`Consumer`]. It
//! owns one connection and one channel at a time, declares the topology of every
//! configured [`Binding`], consumes from the bound queues and settles each message
//! according to what the consumer reported.
//!
//! The agent is an event-driven state machine. Broker RPCs run as spawned tasks and
//! report their confirmation back to a single event loop, so agent state is only
//! ever touched from [`ConsumerAgent::run`]. Every event carries the connection
//! generation it belongs to; events from a torn-down connection are dropped.
//!
//! Recovery policy:
//! - a lost connection or a cancelled consumer reconnects after a fixed delay
//! - a closed channel is a protocol error: the agent closes its connection and stops
//! - an unreachable broker at connect time stops the agent after the reconnect delay

use crate::{
    broker::{Broker, ConnectOptions},
    channel::{Channel, Connection},
    consumer::{Consumer, ConsumerError, Outcome},
    errors::AmqpError,
    message::{Delivery, Message},
    otel,
    queue::Binding,
    topology::{run_step, BindingStep, TopologyConfig},
};
use futures_util::StreamExt;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use std::{borrow::Cow, collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Pause before reconnecting after a lost connection.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Connecting,
    ChannelOpening,
    DeclaringTopology,
    Consuming,
    Reconnecting,
    Stopped,
}

enum Event {
    ConnectionOpened {
        generation: u64,
        connection: Arc<dyn Connection>,
    },
    ConnectionFailed {
        generation: u64,
        error: AmqpError,
    },
    ConnectionClosed {
        generation: u64,
        error: AmqpError,
    },
    ChannelOpened {
        generation: u64,
        channel: Arc<dyn Channel>,
    },
    ChannelFailed {
        generation: u64,
        error: AmqpError,
    },
    ChannelClosed {
        generation: u64,
        error: AmqpError,
    },
    StepConfirmed {
        generation: u64,
        binding: usize,
        step: BindingStep,
    },
    StepFailed {
        generation: u64,
        binding: usize,
        step: BindingStep,
        error: AmqpError,
    },
    ConsumeFailed {
        generation: u64,
        queue: String,
        error: AmqpError,
    },
    Delivered {
        generation: u64,
        delivery: Delivery,
    },
    ConsumerCancelled {
        generation: u64,
        queue: String,
    },
    ReconnectDue {
        generation: u64,
    },
    Stop,
}

impl Event {
    fn generation(&self) -> Option<u64> {
        match self {
            Event::ConnectionOpened { generation, .. }
            | Event::ConnectionFailed { generation, .. }
            | Event::ConnectionClosed { generation, .. }
            | Event::ChannelOpened { generation, .. }
            | Event::ChannelFailed { generation, .. }
            | Event::ChannelClosed { generation, .. }
            | Event::StepConfirmed { generation, .. }
            | Event::StepFailed { generation, .. }
            | Event::ConsumeFailed { generation, .. }
            | Event::Delivered { generation, .. }
            | Event::ConsumerCancelled { generation, .. }
            | Event::ReconnectDue { generation } => Some(*generation),
            Event::Stop => None,
        }
    }
}

/// Requests a running agent to stop from outside its event loop.
#[derive(Clone)]
pub struct AgentHandle {
    events: mpsc::UnboundedSender<Event>,
}

impl AgentHandle {
    pub fn stop(&self) {
        let _ = self.events.send(Event::Stop);
    }
}

/// Passes messages between a [`Broker`] and a [`Consumer`].
pub struct ConsumerAgent {
    consumer: Arc<dyn Consumer>,
    broker: Arc<Broker>,
    bindings: Vec<Binding>,
    topology: Arc<TopologyConfig>,
    ack: bool,
    reconnect_delay: Duration,
    tracer: BoxedTracer,

    events: mpsc::UnboundedSender<Event>,
    receiver: mpsc::UnboundedReceiver<Event>,

    state: AgentState,
    generation: u64,
    connection: Option<Arc<dyn Connection>>,
    channel: Option<Arc<dyn Channel>>,
    consumer_tags: HashMap<String, String>,
    connect_task: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
    exit: Option<Result<(), AmqpError>>,
}

impl ConsumerAgent {
    /// Creates an agent consuming from `bindings`.
    ///
    /// With `no_ack` the broker considers every message settled on delivery and the
    /// agent never acknowledges nor rejects.
    pub fn new(
        consumer: Arc<dyn Consumer>,
        broker: Arc<Broker>,
        bindings: Vec<Binding>,
        no_ack: bool,
        topology: TopologyConfig,
    ) -> ConsumerAgent {
        let (events, receiver) = mpsc::unbounded_channel();

        ConsumerAgent {
            consumer,
            broker,
            bindings,
            topology: Arc::new(topology),
            ack: !no_ack,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            tracer: global::tracer(otel::TRACER_NAME),
            events,
            receiver,
            state: AgentState::Idle,
            generation: 0,
            connection: None,
            channel: None,
            consumer_tags: HashMap::new(),
            connect_task: None,
            tasks: Vec::new(),
            exit: None,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            events: self.events.clone(),
        }
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Connects and processes messages until the agent stops.
    ///
    /// Returns `Ok(())` after [`AgentHandle::stop`] or an interrupted consumer, and
    /// an error when the broker could not be reached or the broker closed the channel.
    pub async fn run(mut self) -> Result<(), AmqpError> {
        info!(bindings = self.bindings.len(), "starting consumer agent");
        self.connect();

        while self.exit.is_none() {
            match self.receiver.recv().await {
                Some(event) => self.handle_event(event).await,
                None => break,
            }
        }

        self.exit.take().unwrap_or(Ok(()))
    }

    async fn handle_event(&mut self, event: Event) {
        if let Some(generation) = event.generation() {
            if generation != self.generation {
                debug!(generation, current = self.generation, "dropping stale event");
                if let Event::ConnectionOpened { connection, .. } = event {
                    tokio::spawn(async move {
                        let _ = connection.close().await;
                    });
                }
                return;
            }
        }

        match event {
            Event::ConnectionOpened { connection, .. } => self.on_connection_open(connection),
            Event::ConnectionFailed { error, .. } => self.on_connection_failure(error).await,
            Event::ConnectionClosed { error, .. } => self.on_connection_close(error),
            Event::ChannelOpened { channel, .. } => self.on_channel_open(channel),
            Event::ChannelFailed { error, .. } => {
                warn!(error = error.to_string(), "could not open a channel");
                self.reconnect();
            }
            Event::ChannelClosed { error, .. } => self.on_channel_close(error).await,
            Event::StepConfirmed { binding, step, .. } => self.on_step_confirmed(binding, step),
            Event::StepFailed {
                binding,
                step,
                error,
                ..
            } => {
                error!(
                    error = error.to_string(),
                    queue = %self.bindings[binding].queue,
                    step = %step,
                    "topology declaration failed"
                );
                self.on_setup_failure(error).await;
            }
            Event::ConsumeFailed { queue, error, .. } => {
                error!(error = error.to_string(), queue = %queue, "could not start consuming");
                self.consumer_tags.remove(&queue);
                self.on_setup_failure(error).await;
            }
            Event::Delivered { delivery, .. } => self.process(delivery).await,
            Event::ConsumerCancelled { queue, .. } => self.on_consumer_cancel(&queue),
            Event::ReconnectDue { .. } => self.connect(),
            Event::Stop => self.stop().await,
        }
    }

    fn transition(&mut self, state: AgentState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "agent state changed");
            self.state = state;
        }
    }

    fn connect(&mut self) {
        info!(broker = %self.broker.name(), "connecting to rabbitmq");
        self.transition(AgentState::Connecting);

        let generation = self.generation;
        let broker = self.broker.clone();
        let events = self.events.clone();
        let opened = self.events.clone();
        let failed = self.events.clone();

        self.connect_task = Some(tokio::spawn(async move {
            let options = ConnectOptions::new()
                .on_open(move |connection| {
                    let _ = opened.send(Event::ConnectionOpened {
                        generation,
                        connection,
                    });
                })
                .on_failure(move |error| {
                    let _ = failed.send(Event::ConnectionFailed { generation, error });
                });

            if let Err(error) = broker.connect(options).await {
                let _ = events.send(Event::ConnectionFailed { generation, error });
            }
        }));
    }

    async fn on_connection_failure(&mut self, error: AmqpError) {
        error!(error = error.to_string(), "giving up on connecting to rabbitmq");
        tokio::time::sleep(self.reconnect_delay).await;
        self.transition(AgentState::Stopped);
        self.exit = Some(Err(error));
    }

    fn on_connection_open(&mut self, connection: Arc<dyn Connection>) {
        info!(broker = %self.broker.name(), "connection opened");
        self.connection = Some(connection.clone());

        let events = self.events.clone();
        let generation = self.generation;
        connection.on_close(Box::new(move |error| {
            let _ = events.send(Event::ConnectionClosed { generation, error });
        }));

        self.open_channel(connection);
    }

    fn on_connection_close(&mut self, error: AmqpError) {
        warn!(error = error.to_string(), "server closed connection");
        self.reconnect();
    }

    fn open_channel(&mut self, connection: Arc<dyn Connection>) {
        info!("creating a new channel");
        self.transition(AgentState::ChannelOpening);

        let events = self.events.clone();
        let generation = self.generation;
        self.tasks.push(tokio::spawn(async move {
            let event = match connection.create_channel().await {
                Ok(channel) => Event::ChannelOpened {
                    generation,
                    channel,
                },
                Err(error) => Event::ChannelFailed { generation, error },
            };
            let _ = events.send(event);
        }));
    }

    fn on_channel_open(&mut self, channel: Arc<dyn Channel>) {
        info!("channel opened");
        self.channel = Some(channel.clone());

        let events = self.events.clone();
        let generation = self.generation;
        channel.on_close(Box::new(move |error| {
            let _ = events.send(Event::ChannelClosed { generation, error });
        }));

        self.create_bindings();
    }

    async fn on_channel_close(&mut self, error: AmqpError) {
        if let AmqpError::ConnectionClosed(_) = error {
            self.on_connection_close(error);
            return;
        }

        warn!(error = error.to_string(), "server closed channel");
        self.shutdown(error).await;
    }

    fn create_bindings(&mut self) {
        info!(bindings = self.bindings.len(), "creating queue bindings");
        self.transition(AgentState::DeclaringTopology);

        for index in 0..self.bindings.len() {
            let binding = &self.bindings[index];
            debug!(
                queue = %binding.queue,
                exchange = %binding.exchange,
                routing_key = %binding.routing_key,
                "creating queue binding"
            );
            self.spawn_step(index, BindingStep::ExchangeDeclaring);
        }

        self.check_consuming();
    }

    fn spawn_step(&mut self, binding: usize, step: BindingStep) {
        let Some(channel) = self.channel.clone() else {
            return;
        };
        let topology = self.topology.clone();
        let descriptor = self.bindings[binding].clone();
        let events = self.events.clone();
        let generation = self.generation;

        self.tasks.push(tokio::spawn(async move {
            let event = match run_step(channel.as_ref(), &topology, &descriptor, step).await {
                Ok(()) => Event::StepConfirmed {
                    generation,
                    binding,
                    step,
                },
                Err(error) => Event::StepFailed {
                    generation,
                    binding,
                    step,
                    error,
                },
            };
            let _ = events.send(event);
        }));
    }

    fn on_step_confirmed(&mut self, binding: usize, step: BindingStep) {
        debug!(queue = %self.bindings[binding].queue, step = %step, "step confirmed");

        match step.next() {
            Some(BindingStep::EnsuringConsume) => {
                let queue = self.bindings[binding].queue.clone();
                self.ensure_consuming(&queue);
            }
            Some(next) => self.spawn_step(binding, next),
            None => {}
        }
    }

    async fn on_setup_failure(&mut self, error: AmqpError) {
        match error {
            AmqpError::ConnectionClosed(_) => self.on_connection_close(error),
            other => self.shutdown(other).await,
        }
    }

    fn ensure_consuming(&mut self, queue: &str) {
        if !self.is_consuming_from(queue) {
            self.start_consuming(queue);
        }
        self.check_consuming();
    }

    fn is_consuming_from(&self, queue: &str) -> bool {
        self.consumer_tags.contains_key(queue)
    }

    fn check_consuming(&mut self) {
        if self
            .bindings
            .iter()
            .all(|binding| self.is_consuming_from(&binding.queue))
        {
            info!(queues = self.consumer_tags.len(), "consuming");
            self.transition(AgentState::Consuming);
        }
    }

    fn start_consuming(&mut self, queue: &str) {
        let Some(channel) = self.channel.clone() else {
            return;
        };

        let consumer_tag = format!("{queue}.{}", Uuid::new_v4());
        info!(queue, consumer_tag = %consumer_tag, "issuing basic consume");
        self.consumer_tags
            .insert(queue.to_owned(), consumer_tag.clone());

        let events = self.events.clone();
        let generation = self.generation;
        let no_ack = !self.ack;
        let queue = queue.to_owned();

        self.tasks.push(tokio::spawn(async move {
            let mut deliveries = match channel.basic_consume(&queue, &consumer_tag, no_ack).await {
                Ok(stream) => stream,
                Err(error) => {
                    let _ = events.send(Event::ConsumeFailed {
                        generation,
                        queue,
                        error,
                    });
                    return;
                }
            };

            while let Some(result) = deliveries.next().await {
                match result {
                    Ok(delivery) => {
                        if events
                            .send(Event::Delivered {
                                generation,
                                delivery,
                            })
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(err) => {
                        error!(error = err.to_string(), queue = %queue, "consumer stream failed");
                        break;
                    }
                }
            }

            let _ = events.send(Event::ConsumerCancelled { generation, queue });
        }));
    }

    fn on_consumer_cancel(&mut self, queue: &str) {
        let channel_open = self.channel.as_ref().is_some_and(|channel| channel.is_open());
        if !channel_open {
            debug!(queue, "consumer ended with its channel");
            return;
        }

        info!(queue, "consumer was cancelled remotely");
        self.reconnect();
    }

    async fn process(&mut self, delivery: Delivery) {
        let Some(channel) = self.channel.clone() else {
            return;
        };

        let message = Message::new(channel, delivery.method, &delivery.header, &delivery.body);
        debug!(delivery_tag = message.delivery_tag(), "received message");
        debug!(body = %String::from_utf8_lossy(message.body()), "message body");

        if self.dispatch(&message).await && self.ack {
            self.acknowledge(&message).await;
        }
    }

    /// Runs the consumer and applies its outcome. Returns whether the message may
    /// be acknowledged.
    async fn dispatch(&mut self, message: &Message) -> bool {
        let name = message.kind().unwrap_or(message.routing_key()).to_owned();
        let (ctx, mut span) = otel::new_span(message.headers(), &self.tracer, &name);

        let result = self.consumer.process(&ctx, message).await;
        let outcome = Outcome::of(&result);

        match &result {
            Ok(()) => span.set_status(Status::Ok),
            Err(err) => {
                span.record_error(err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
            }
        }

        match (outcome, result) {
            (Outcome::Success, _) => return true,
            (Outcome::Reconnect, Err(err)) => {
                error!(error = err.to_string(), "rabbitmq closed the channel or connection");
                self.reconnect();
            }
            (Outcome::Stop, _) => {
                self.reject(message.delivery_tag(), true).await;
                self.stop().await;
            }
            (outcome, result) => {
                if let Err(err) = &result {
                    record_error(err);
                }
                if let Some(requeue) = outcome.reject() {
                    self.reject(message.delivery_tag(), requeue).await;
                }
            }
        }

        false
    }

    async fn acknowledge(&self, message: &Message) {
        let Some(channel) = &self.channel else {
            return;
        };

        debug!(delivery_tag = message.delivery_tag(), "acknowledging message");
        if let Err(err) = channel.basic_ack(message.delivery_tag()).await {
            error!(
                error = err.to_string(),
                delivery_tag = message.delivery_tag(),
                "error whiling ack msg"
            );
        }
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) {
        if !self.ack {
            debug!(delivery_tag, "no-ack mode, not rejecting");
            return;
        }
        let Some(channel) = &self.channel else {
            return;
        };

        warn!(delivery_tag, requeue, "rejecting message");
        if let Err(err) = channel.basic_nack(delivery_tag, requeue).await {
            error!(error = err.to_string(), delivery_tag, "error whiling nack msg");
        }
    }

    /// Drops every piece of state tied to the current connection.
    fn reinitialize(&mut self) {
        self.generation += 1;
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.channel = None;
        self.consumer_tags.clear();
    }

    fn reconnect(&mut self) {
        info!("reinitializing");
        self.reinitialize();

        if let Some(connection) = self.connection.take() {
            if connection.is_open() {
                tokio::spawn(async move {
                    if let Err(err) = connection.close().await {
                        debug!(error = err.to_string(), "closing stale connection failed");
                    }
                });
            }
        }

        info!(delay_secs = self.reconnect_delay.as_secs_f64(), "reconnecting");
        self.transition(AgentState::Reconnecting);

        let events = self.events.clone();
        let generation = self.generation;
        let delay = self.reconnect_delay;
        self.tasks.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::ReconnectDue { generation });
        }));
    }

    async fn stop(&mut self) {
        info!("stopping");
        self.reinitialize();
        self.disconnect().await;
        self.transition(AgentState::Stopped);
        self.exit.get_or_insert(Ok(()));
        info!("exiting");
    }

    async fn shutdown(&mut self, error: AmqpError) {
        self.stop().await;
        self.exit = Some(Err(error));
    }

    async fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            if connection.is_open() {
                info!(broker = %self.broker.name(), "closing connection");
                if let Err(err) = connection.close().await {
                    warn!(error = err.to_string(), "error closing the connection");
                }
            }
        }
    }
}

fn record_error(err: &ConsumerError) {
    warn!(error = err.to_string(), "agent handled consumer error");
    if let ConsumerError::Unexpected(source) = err {
        debug!(source = ?source, "unexpected consumer error");
    }
}

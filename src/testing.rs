// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Recording fakes of the connector, connection and channel seams.
//!
//! Every broker RPC is recorded as an [`Op`]; tests drive broker-side events
//! (deliveries, cancellations, closes) through the helper methods.

use crate::{
    broker::ConnectionParameters,
    channel::{Channel, CloseHandler, Connection, Connector, DeliveryStream},
    errors::AmqpError,
    exchange::ExchangeOptions,
    message::{Delivery, DeliveryMethod},
    queue::QueueOptions,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::BasicProperties;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    ExchangeDeclare(String, ExchangeOptions),
    QueueDeclare(String, QueueOptions),
    QueueBind(String, String, String),
    Consume(String, String, bool),
    Ack(u64),
    Nack(u64, bool),
    ConfirmSelect,
    Publish(String, String),
}

#[derive(Debug, Clone)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: BasicProperties,
}

type Sender = mpsc::UnboundedSender<Result<Delivery, AmqpError>>;

#[derive(Default)]
pub struct FakeChannel {
    open: AtomicBool,
    ops: Mutex<Vec<Op>>,
    published: Mutex<Vec<Published>>,
    close_handler: Mutex<Option<CloseHandler>>,
    consumers: Mutex<HashMap<String, (String, Sender)>>,
    exchange_delays: Mutex<HashMap<String, Duration>>,
    failing_exchanges: Mutex<HashSet<String>>,
    failing_queues: Mutex<HashSet<String>>,
    consume_errors: Mutex<VecDeque<AmqpError>>,
    publish_errors: Mutex<VecDeque<AmqpError>>,
}

impl FakeChannel {
    pub fn new() -> Arc<FakeChannel> {
        let channel = FakeChannel::default();
        channel.open.store(true, Ordering::SeqCst);
        Arc::new(channel)
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    /// Queue names a consumer was started on, in order.
    pub fn consumed_queues(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Consume(queue, _, _) => Some(queue),
                _ => None,
            })
            .collect()
    }

    pub fn settlements(&self) -> Vec<Op> {
        self.ops()
            .into_iter()
            .filter(|op| matches!(op, Op::Ack(_) | Op::Nack(_, _)))
            .collect()
    }

    pub fn delay_exchange(&self, exchange: &str, delay: Duration) {
        self.exchange_delays
            .lock()
            .unwrap()
            .insert(exchange.to_owned(), delay);
    }

    pub fn fail_exchange_declare(&self, exchange: &str) {
        self.failing_exchanges
            .lock()
            .unwrap()
            .insert(exchange.to_owned());
    }

    pub fn fail_queue_declare(&self, queue: &str) {
        self.failing_queues.lock().unwrap().insert(queue.to_owned());
    }

    pub fn fail_next_consume(&self, err: AmqpError) {
        self.consume_errors.lock().unwrap().push_back(err);
    }

    pub fn fail_next_publish(&self, err: AmqpError) {
        self.publish_errors.lock().unwrap().push_back(err);
    }

    /// Pushes a delivery into the consumer running on `queue`.
    pub fn deliver(&self, queue: &str, delivery_tag: u64, header: BasicProperties, body: &[u8]) {
        let consumers = self.consumers.lock().unwrap();
        let (tag, sender) = consumers.get(queue).expect("no consumer on queue");
        let delivery = Delivery {
            method: DeliveryMethod {
                consumer_tag: tag.clone(),
                delivery_tag,
                exchange: "events".to_owned(),
                routing_key: queue.to_owned(),
                redelivered: false,
            },
            header,
            body: body.to_vec(),
        };
        sender.send(Ok(delivery)).expect("consumer stream dropped");
    }

    /// Fails the consumer stream on `queue` with `err`.
    pub fn break_stream(&self, queue: &str, err: AmqpError) {
        let consumers = self.consumers.lock().unwrap();
        let (_, sender) = consumers.get(queue).expect("no consumer on queue");
        sender.send(Err(err)).expect("consumer stream dropped");
    }

    /// Ends the consumer stream on `queue`, as a broker-side cancel would.
    pub fn cancel(&self, queue: &str) {
        self.consumers.lock().unwrap().remove(queue);
    }

    /// Closes the channel from the broker side.
    pub fn close(&self, reason: &str) {
        self.close_with(AmqpError::ChannelClosed(reason.to_owned()));
    }

    /// Closes the channel, reporting `err` to its close handler.
    pub fn close_with(&self, err: AmqpError) {
        self.open.store(false, Ordering::SeqCst);
        self.consumers.lock().unwrap().clear();
        let handler = self.close_handler.lock().unwrap().take();
        if let Some(handler) = handler {
            handler(err);
        }
    }

    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn record(&self, op: Op) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl Channel for FakeChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn on_close(&self, handler: CloseHandler) {
        *self.close_handler.lock().unwrap() = Some(handler);
    }

    async fn exchange_declare(
        &self,
        name: &str,
        options: &ExchangeOptions,
    ) -> Result<(), AmqpError> {
        let delay = self.exchange_delays.lock().unwrap().get(name).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.record(Op::ExchangeDeclare(name.to_owned(), options.clone()));
        if self.failing_exchanges.lock().unwrap().contains(name) {
            return Err(AmqpError::DeclareExchangeError(name.to_owned()));
        }
        Ok(())
    }

    async fn queue_declare(&self, name: &str, options: &QueueOptions) -> Result<(), AmqpError> {
        self.record(Op::QueueDeclare(name.to_owned(), options.clone()));
        if self.failing_queues.lock().unwrap().contains(name) {
            return Err(AmqpError::DeclareQueueError(name.to_owned()));
        }
        Ok(())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.record(Op::QueueBind(
            queue.to_owned(),
            exchange.to_owned(),
            routing_key.to_owned(),
        ));
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        self.record(Op::Consume(queue.to_owned(), consumer_tag.to_owned(), no_ack));
        if let Some(err) = self.consume_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.consumers
            .lock()
            .unwrap()
            .insert(queue.to_owned(), (consumer_tag.to_owned(), tx));
        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.record(Op::Ack(delivery_tag));
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.record(Op::Nack(delivery_tag, requeue));
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.record(Op::ConfirmSelect);
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        if let Some(err) = self.publish_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.record(Op::Publish(exchange.to_owned(), routing_key.to_owned()));
        self.published.lock().unwrap().push(Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            body: body.to_vec(),
            properties,
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeConnection {
    open: AtomicBool,
    closes: AtomicUsize,
    close_handler: Mutex<Option<CloseHandler>>,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
    exchange_delays: HashMap<String, Duration>,
    failing_exchanges: HashSet<String>,
    consume_errors: Mutex<VecDeque<AmqpError>>,
    pub host: String,
}

impl FakeConnection {
    pub fn last_channel(&self) -> Option<Arc<FakeChannel>> {
        self.channels.lock().unwrap().last().cloned()
    }

    /// Number of client-initiated closes.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Drops the connection from the broker side.
    pub fn drop_connection(&self, reason: &str) {
        self.open.store(false, Ordering::SeqCst);
        for channel in self.channels.lock().unwrap().iter() {
            channel.mark_closed();
        }
        let handler = self.close_handler.lock().unwrap().take();
        if let Some(handler) = handler {
            handler(AmqpError::ConnectionClosed(reason.to_owned()));
        }
    }
}

#[async_trait]
impl Connection for FakeConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn on_close(&self, handler: CloseHandler) {
        *self.close_handler.lock().unwrap() = Some(handler);
    }

    async fn create_channel(&self) -> Result<Arc<dyn Channel>, AmqpError> {
        let channel = FakeChannel::new();
        for (exchange, delay) in &self.exchange_delays {
            channel.delay_exchange(exchange, *delay);
        }
        for exchange in &self.failing_exchanges {
            channel.fail_exchange_declare(exchange);
        }
        for err in self.consume_errors.lock().unwrap().drain(..) {
            channel.fail_next_consume(err);
        }
        self.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector whose outcome per attempt is scripted by host name.
#[derive(Default)]
pub struct FakeConnector {
    attempts: Mutex<Vec<ConnectionParameters>>,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    down_hosts: Mutex<HashSet<String>>,
    exchange_delays: Mutex<HashMap<String, Duration>>,
    failing_exchanges: Mutex<HashSet<String>>,
    consume_errors: Mutex<VecDeque<AmqpError>>,
    fail_all: AtomicBool,
    fail_next: AtomicUsize,
}

impl FakeConnector {
    pub fn new() -> Arc<FakeConnector> {
        Arc::new(FakeConnector::default())
    }

    pub fn failing() -> Arc<FakeConnector> {
        let connector = FakeConnector::default();
        connector.fail_all.store(true, Ordering::SeqCst);
        Arc::new(connector)
    }

    /// Delays exchange declares on every channel of connections opened afterwards.
    pub fn delay_exchange(&self, exchange: &str, delay: Duration) {
        self.exchange_delays
            .lock()
            .unwrap()
            .insert(exchange.to_owned(), delay);
    }

    /// Fails exchange declares on every channel of connections opened afterwards.
    pub fn fail_exchange_declare(&self, exchange: &str) {
        self.failing_exchanges
            .lock()
            .unwrap()
            .insert(exchange.to_owned());
    }

    /// Fails the next consume on the first channel of the next connection.
    pub fn fail_next_consume(&self, err: AmqpError) {
        self.consume_errors.lock().unwrap().push_back(err);
    }

    pub fn take_down(&self, host: &str) {
        self.down_hosts.lock().unwrap().insert(host.to_owned());
    }

    pub fn fail_next(&self, attempts: usize) {
        self.fail_next.store(attempts, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_all.store(failing, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> Vec<ConnectionParameters> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn attempted_hosts(&self) -> Vec<String> {
        self.attempts()
            .into_iter()
            .map(|params| params.host.unwrap_or_default())
            .collect()
    }

    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.connections.lock().unwrap().clone()
    }

    pub fn last_connection(&self) -> Option<Arc<FakeConnection>> {
        self.connections.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        params: &ConnectionParameters,
    ) -> Result<Arc<dyn Connection>, AmqpError> {
        self.attempts.lock().unwrap().push(params.clone());
        let host = params.host.clone().unwrap_or_default();

        let scripted = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        if scripted
            || self.fail_all.load(Ordering::SeqCst)
            || self.down_hosts.lock().unwrap().contains(&host)
        {
            return Err(AmqpError::ConnectionError(format!("{host} is unreachable")));
        }

        let conn = Arc::new(FakeConnection {
            host,
            exchange_delays: self.exchange_delays.lock().unwrap().clone(),
            failing_exchanges: self.failing_exchanges.lock().unwrap().clone(),
            consume_errors: Mutex::new(self.consume_errors.lock().unwrap().drain(..).collect()),
            ..FakeConnection::default()
        });
        conn.open.store(true, Ordering::SeqCst);
        self.connections.lock().unwrap().push(conn.clone());
        Ok(conn)
    }
}

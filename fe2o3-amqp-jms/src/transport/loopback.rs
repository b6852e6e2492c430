//! In-process binding that routes messages without a network
//!
//! [`LoopbackBroker`] keeps pre-provisioned queues, topic subscriptions and temporary queues in
//! memory and implements just enough broker behaviour for the session layer: credit based
//! dispatch, settlement, redelivery of released or orphaned deliveries, and deletion of
//! temporary queues with their connection. Messages are pushed through [`codec`] on the way in,
//! so what a consumer sees is what the AMQP mapping preserves.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    codec, Binding, ConnectOptions, DeliveryTag, Disposition, Inbound, LinkReceiver, LinkSender,
    Transport, TransportError, TransportSession,
};
use crate::{
    destination::{Destination, TemporaryQueue},
    message::Message,
};

type ConnId = u64;
type ReceiverId = u64;

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<Message>,
    consumers: Vec<ReceiverId>,
    cursor: usize,
    max_depth: Option<usize>,
    temporary_owner: Option<ConnId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Origin {
    Queue(String),
    Topic(String),
}

#[derive(Debug)]
struct ReceiverState {
    connection: ConnId,
    origin: Origin,
    credit: u32,
    next_tag: DeliveryTag,
    unsettled: BTreeMap<DeliveryTag, Message>,
    tx: mpsc::UnboundedSender<Result<Inbound, TransportError>>,
}

#[derive(Debug)]
struct ConnectionState {
    failures: mpsc::UnboundedSender<TransportError>,
}

#[derive(Debug, Default)]
struct BrokerState {
    credentials: Option<(String, String)>,
    refuse: bool,
    queues: HashMap<String, QueueState>,
    subscriptions: HashMap<String, Vec<ReceiverId>>,
    receivers: HashMap<ReceiverId, ReceiverState>,
    connections: HashMap<ConnId, ConnectionState>,
    next_id: u64,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn ensure_connected(&self, connection: ConnId) -> Result<(), TransportError> {
        match self.connections.contains_key(&connection) {
            true => Ok(()),
            false => Err(TransportError::ConnectionLost("connection closed".to_string())),
        }
    }

    fn queue_exists(&self, destination: &Destination) -> bool {
        match destination {
            Destination::Queue(queue) => self
                .queues
                .get(queue.name())
                .map(|q| q.temporary_owner.is_none())
                .unwrap_or(false),
            Destination::TemporaryQueue(queue) => self
                .queues
                .get(queue.name())
                .map(|q| q.temporary_owner.is_some())
                .unwrap_or(false),
            Destination::Topic(_) => true,
        }
    }

    /// Hands queued messages to consumers with credit, round robin
    fn dispatch(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.messages.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let mut chosen = None;
            for offset in 0..count {
                let index = (queue.cursor + offset) % count;
                let id = queue.consumers[index];
                if self.receivers.get(&id).map(|r| r.credit > 0).unwrap_or(false) {
                    chosen = Some((index, id));
                    break;
                }
            }
            let Some((index, id)) = chosen else {
                return;
            };
            queue.cursor = (index + 1) % count;
            let Some(message) = queue.messages.pop_front() else {
                return;
            };

            if let Some(receiver) = self.receivers.get_mut(&id) {
                receiver.credit -= 1;
                if let Err(message) = receiver.push(message) {
                    if let Some(queue) = self.queues.get_mut(queue_name) {
                        queue.messages.push_front(message);
                    }
                    self.detach_receiver(id);
                }
            }
        }
    }

    fn publish(&mut self, topic: &str, message: Message) {
        let subscribers = self.subscriptions.get(topic).cloned().unwrap_or_default();
        for id in subscribers {
            if let Some(receiver) = self.receivers.get_mut(&id) {
                if receiver.push(message.clone()).is_err() {
                    self.detach_receiver(id);
                }
            }
        }
    }

    fn give_back(&mut self, origin: &Origin, receiver: ReceiverId, mut messages: Vec<Message>) {
        for message in messages.iter_mut() {
            message.delivery_count += 1;
        }
        match origin {
            Origin::Queue(name) => {
                if let Some(queue) = self.queues.get_mut(name) {
                    for message in messages.into_iter().rev() {
                        queue.messages.push_front(message);
                    }
                }
                self.dispatch(name);
            }
            Origin::Topic(_) => {
                if let Some(state) = self.receivers.get_mut(&receiver) {
                    for message in messages {
                        let _ = state.push(message);
                    }
                }
            }
        }
    }

    /// Removes a receiver, returning its unsettled deliveries to the queue
    fn detach_receiver(&mut self, id: ReceiverId) {
        let Some(receiver) = self.receivers.remove(&id) else {
            return;
        };
        match &receiver.origin {
            Origin::Queue(name) => {
                if let Some(queue) = self.queues.get_mut(name) {
                    queue.consumers.retain(|c| *c != id);
                    queue.cursor = 0;
                }
                let unsettled: Vec<Message> = receiver.unsettled.into_values().collect();
                self.give_back(&Origin::Queue(name.clone()), id, unsettled);
            }
            Origin::Topic(name) => {
                if let Some(subscribers) = self.subscriptions.get_mut(name) {
                    subscribers.retain(|c| *c != id);
                }
            }
        }
    }

    fn delete_queue(&mut self, name: &str) {
        if let Some(queue) = self.queues.remove(name) {
            for id in queue.consumers {
                if let Some(receiver) = self.receivers.remove(&id) {
                    let _ = receiver
                        .tx
                        .send(Err(TransportError::Detached(format!("{} was deleted", name))));
                }
            }
        }
    }

    fn drop_connection(&mut self, connection: ConnId) {
        let receivers: Vec<ReceiverId> = self
            .receivers
            .iter()
            .filter(|(_, r)| r.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for id in receivers {
            self.detach_receiver(id);
        }
        let temporary: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.temporary_owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect();
        for name in temporary {
            self.delete_queue(&name);
        }
        self.connections.remove(&connection);
    }
}

impl ReceiverState {
    fn push(&mut self, message: Message) -> Result<(), Message> {
        self.next_tag += 1;
        let tag = self.next_tag;
        self.unsettled.insert(tag, message.clone());
        match self.tx.send(Ok(Inbound { tag, message })) {
            Ok(()) => Ok(()),
            Err(_) => Err(self.unsettled.remove(&tag).unwrap_or_default()),
        }
    }
}

/// An in-memory broker implementing [`Binding`]
///
/// Queues must be provisioned before they are used, like on a real broker. Cloning the broker
/// yields another handle to the same state.
#[derive(Debug, Clone, Default)]
pub struct LoopbackBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl LoopbackBroker {
    /// Creates an empty broker that accepts anonymous connections
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept connections that present these credentials
    pub fn with_credentials(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.state.lock().credentials = Some((username.into(), password.into()));
        self
    }

    /// Creates a durable queue
    pub fn provision_queue(&self, name: impl Into<String>) -> &Self {
        self.state.lock().queues.entry(name.into()).or_default();
        self
    }

    /// Creates a durable queue that rejects persistent messages once it holds `max_depth`
    pub fn provision_bounded_queue(&self, name: impl Into<String>, max_depth: usize) -> &Self {
        let mut state = self.state.lock();
        let queue = state.queues.entry(name.into()).or_default();
        queue.max_depth = Some(max_depth);
        self
    }

    /// Number of messages waiting in a queue, excluding unsettled deliveries
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.state.lock().queues.get(name).map(|q| q.messages.len())
    }

    /// Whether a queue, durable or temporary, exists
    pub fn has_queue(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    /// Number of unsettled deliveries across all receivers
    pub fn unsettled_count(&self) -> usize {
        self.state
            .lock()
            .receivers
            .values()
            .map(|r| r.unsettled.len())
            .sum()
    }

    /// Number of open connections
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Refuse new connections as if the broker were unreachable
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse = refuse;
    }

    /// Force-closes every open connection, as a broker restart would
    pub fn disconnect_all(&self) {
        let mut state = self.state.lock();
        let connections: Vec<ConnId> = state.connections.keys().copied().collect();
        for id in connections {
            if let Some(connection) = state.connections.get(&id) {
                let _ = connection.failures.send(TransportError::ConnectionLost(
                    "connection forced closed by broker".to_string(),
                ));
            }
            state.drop_connection(id);
        }
    }
}

#[async_trait]
impl Binding for LoopbackBroker {
    async fn connect(&self, options: ConnectOptions<'_>) -> Result<Box<dyn Transport>, TransportError> {
        let mut state = self.state.lock();
        if state.refuse {
            return Err(TransportError::ConnectionLost(format!(
                "connection to {} refused",
                options.url
            )));
        }
        if let Some((username, password)) = &state.credentials {
            let presented = (options.username, options.password);
            if presented != (Some(username.as_str()), Some(password.as_str())) {
                return Err(TransportError::Authentication(
                    "SASL PLAIN credentials rejected".to_string(),
                ));
            }
        }

        let id = state.next_id();
        let (failures, failures_rx) = mpsc::unbounded_channel();
        state.connections.insert(id, ConnectionState { failures });

        Ok(Box::new(LoopbackTransport {
            broker: self.clone(),
            connection: id,
            failures: Some(failures_rx),
        }))
    }
}

struct LoopbackTransport {
    broker: LoopbackBroker,
    connection: ConnId,
    failures: Option<mpsc::UnboundedReceiver<TransportError>>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn begin(&mut self) -> Result<Box<dyn TransportSession>, TransportError> {
        self.broker.state.lock().ensure_connected(self.connection)?;
        Ok(Box::new(LoopbackSession {
            broker: self.broker.clone(),
            connection: self.connection,
        }))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.broker.state.lock().drop_connection(self.connection);
        Ok(())
    }

    fn take_failures(&mut self) -> Option<mpsc::UnboundedReceiver<TransportError>> {
        self.failures.take()
    }
}

struct LoopbackSession {
    broker: LoopbackBroker,
    connection: ConnId,
}

#[async_trait]
impl TransportSession for LoopbackSession {
    async fn attach_sender(
        &mut self,
        _name: String,
        destination: &Destination,
    ) -> Result<Box<dyn LinkSender>, TransportError> {
        let state = self.broker.state.lock();
        state.ensure_connected(self.connection)?;
        if !state.queue_exists(destination) {
            return Err(TransportError::NotFound(destination.name().to_string()));
        }
        Ok(Box::new(LoopbackSender {
            broker: self.broker.clone(),
            connection: self.connection,
            destination: destination.clone(),
            anchors: None,
        }))
    }

    async fn attach_receiver(
        &mut self,
        _name: String,
        destination: &Destination,
        prefetch: u32,
    ) -> Result<Box<dyn LinkReceiver>, TransportError> {
        let mut state = self.broker.state.lock();
        state.ensure_connected(self.connection)?;
        if !state.queue_exists(destination) {
            return Err(TransportError::NotFound(destination.name().to_string()));
        }

        let id = state.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let origin = match destination {
            Destination::Topic(topic) => Origin::Topic(topic.name().to_string()),
            other => Origin::Queue(other.name().to_string()),
        };
        state.receivers.insert(
            id,
            ReceiverState {
                connection: self.connection,
                origin: origin.clone(),
                credit: prefetch.max(1),
                next_tag: 0,
                unsettled: BTreeMap::new(),
                tx,
            },
        );
        match &origin {
            Origin::Queue(name) => {
                if let Some(queue) = state.queues.get_mut(name) {
                    queue.consumers.push(id);
                }
                state.dispatch(name);
            }
            Origin::Topic(name) => {
                state.subscriptions.entry(name.clone()).or_default().push(id);
            }
        }

        Ok(Box::new(LoopbackReceiver {
            broker: self.broker.clone(),
            id,
            rx,
        }))
    }

    async fn create_temporary_queue(
        &mut self,
        _name: String,
    ) -> Result<(String, Box<dyn LinkSender>), TransportError> {
        let mut state = self.broker.state.lock();
        state.ensure_connected(self.connection)?;
        let address = format!("#P2P/QTMP/{}/{}", self.connection, uuid::Uuid::new_v4());
        state.queues.insert(
            address.clone(),
            QueueState {
                temporary_owner: Some(self.connection),
                ..Default::default()
            },
        );
        let anchor = LoopbackSender {
            broker: self.broker.clone(),
            connection: self.connection,
            destination: Destination::TemporaryQueue(TemporaryQueue::remote(address.clone())),
            anchors: Some(address.clone()),
        };
        Ok((address, Box::new(anchor)))
    }

    async fn end(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct LoopbackSender {
    broker: LoopbackBroker,
    connection: ConnId,
    destination: Destination,
    /// Temporary queue deleted when this link closes
    anchors: Option<String>,
}

#[async_trait]
impl LinkSender for LoopbackSender {
    async fn send(&mut self, message: &Message, settled: bool) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        state.ensure_connected(self.connection)?;
        let message = codec::decode(codec::encode(message));

        match &self.destination {
            Destination::Topic(topic) => {
                state.publish(topic.name(), message);
                Ok(())
            }
            destination => {
                let name = destination.name().to_string();
                let Some(queue) = state.queues.get_mut(&name) else {
                    return Err(TransportError::NotFound(name));
                };
                if let Some(max_depth) = queue.max_depth {
                    if queue.messages.len() >= max_depth {
                        return match settled {
                            true => Ok(()),
                            false => Err(TransportError::Rejected(
                                "amqp:resource-limit-exceeded".to_string(),
                            )),
                        };
                    }
                }
                queue.messages.push_back(message);
                state.dispatch(&name);
                Ok(())
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(address) = self.anchors.take() {
            self.broker.state.lock().delete_queue(&address);
        }
        Ok(())
    }
}

struct LoopbackReceiver {
    broker: LoopbackBroker,
    id: ReceiverId,
    rx: mpsc::UnboundedReceiver<Result<Inbound, TransportError>>,
}

#[async_trait]
impl LinkReceiver for LoopbackReceiver {
    async fn recv(&mut self) -> Result<Inbound, TransportError> {
        match self.rx.recv().await {
            Some(result) => result,
            None => Err(TransportError::ConnectionLost(
                "link closed by the broker".to_string(),
            )),
        }
    }

    async fn settle(&mut self, tag: DeliveryTag, disposition: Disposition) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        let Some(receiver) = state.receivers.get_mut(&self.id) else {
            return Err(TransportError::Detached("receiver is detached".to_string()));
        };
        let Some(message) = receiver.unsettled.remove(&tag) else {
            return Ok(());
        };
        let origin = receiver.origin.clone();
        if let Origin::Queue(_) = origin {
            receiver.credit += 1;
        }
        match disposition {
            Disposition::Accepted => {
                if let Origin::Queue(name) = &origin {
                    state.dispatch(name);
                }
            }
            Disposition::Released => state.give_back(&origin, self.id, vec![message]),
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.broker.state.lock().detach_receiver(self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn options(url: &Url) -> ConnectOptions<'_> {
        ConnectOptions {
            url,
            container_id: "test",
            username: None,
            password: None,
            idle_timeout: None,
        }
    }

    #[tokio::test]
    async fn released_delivery_is_redelivered() {
        let broker = LoopbackBroker::new();
        broker.provision_queue("q");
        let url = Url::parse("amqp://localhost:5672").unwrap();
        let mut transport = broker.connect(options(&url)).await.unwrap();
        let mut session = transport.begin().await.unwrap();
        let queue = Destination::queue("q");

        let mut sender = session.attach_sender("s".into(), &queue).await.unwrap();
        sender.send(&Message::text("one"), false).await.unwrap();
        sender.send(&Message::text("two"), false).await.unwrap();

        let mut receiver = session.attach_receiver("r".into(), &queue, 10).await.unwrap();
        let first = receiver.recv().await.unwrap();
        assert_eq!(first.message.text_body(), Some("one"));
        receiver.settle(first.tag, Disposition::Released).await.unwrap();

        let second = receiver.recv().await.unwrap();
        assert_eq!(second.message.text_body(), Some("two"));
        let again = receiver.recv().await.unwrap();
        assert_eq!(again.message.text_body(), Some("one"));
        assert!(again.message.redelivered());
    }

    #[tokio::test]
    async fn temporary_queue_is_deleted_with_its_connection() {
        let broker = LoopbackBroker::new();
        let url = Url::parse("amqp://localhost:5672").unwrap();
        let mut transport = broker.connect(options(&url)).await.unwrap();
        let mut session = transport.begin().await.unwrap();
        let (address, _anchor) = session.create_temporary_queue("t".into()).await.unwrap();
        assert!(broker.has_queue(&address));

        transport.close().await.unwrap();
        assert!(!broker.has_queue(&address));
        assert_eq!(broker.connection_count(), 0);
    }

    #[tokio::test]
    async fn unknown_queue_is_not_found() {
        let broker = LoopbackBroker::new();
        let url = Url::parse("amqp://localhost:5672").unwrap();
        let mut transport = broker.connect(options(&url)).await.unwrap();
        let mut session = transport.begin().await.unwrap();
        let result = session
            .attach_receiver("r".into(), &Destination::queue("missing"), 1)
            .await;
        assert!(matches!(result, Err(TransportError::NotFound(_))));
    }

    #[tokio::test]
    async fn credentials_are_checked() {
        let broker = LoopbackBroker::new().with_credentials("clientUsername", "password");
        let url = Url::parse("amqp://localhost:5672").unwrap();
        let result = broker.connect(options(&url)).await;
        assert!(matches!(result, Err(TransportError::Authentication(_))));
    }
}

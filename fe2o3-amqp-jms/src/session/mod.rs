//! Sessions: the factory of producers, consumers and messages

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    connection::ConnectionInner,
    consumer::{self, Consumer, ConsumerShared},
    destination::{Destination, Queue, TemporaryQueue, Topic},
    error::{Error, Result},
    message::Message,
    producer::Producer,
    transport::{LinkReceiver, LinkSender, TransportSession},
};

pub(crate) mod ack;
pub(crate) mod dispatcher;

use self::{
    ack::AckTracker,
    dispatcher::{dispatch_loop, DispatchCommand},
};

/// When a received message counts as consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Acknowledged when `receive` returns it or when the listener returns normally
    #[default]
    AutoAck,

    /// Acknowledged by [`Message::acknowledge`], which also acknowledges every message delivered
    /// before it on the same session
    ClientAck,

    /// Like [`AckMode::AutoAck`], but duplicates are tolerated after a failure
    DupsOkAck,
}

pub(crate) struct SessionInner {
    id: u64,
    pub(crate) mode: AckMode,
    pub(crate) connection: Arc<ConnectionInner>,
    transport: tokio::sync::Mutex<Option<Box<dyn TransportSession>>>,
    closed: AtomicBool,
    pub(crate) cancel: CancellationToken,
    pub(crate) acks: Arc<AckTracker>,
    pub(crate) dispatcher: mpsc::UnboundedSender<DispatchCommand>,
    consumers: Mutex<HashMap<u64, Arc<ConsumerShared>>>,
    next_link: AtomicU64,
    links: TaskTracker,
}

impl fmt::Debug for SessionInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionInner")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("connection", &self.connection.id)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

impl SessionInner {
    pub(crate) async fn begin(connection: Arc<ConnectionInner>, mode: AckMode) -> Result<Arc<Self>> {
        let transport = connection.begin_session().await?;
        let cancel = connection.cancel.child_token();
        let (dispatcher, commands) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_loop(commands, connection.started(), cancel.clone()));

        Ok(Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            mode,
            connection,
            transport: tokio::sync::Mutex::new(Some(transport)),
            closed: AtomicBool::new(false),
            cancel,
            acks: Arc::new(AckTracker::default()),
            dispatcher,
            consumers: Mutex::new(HashMap::new()),
            next_link: AtomicU64::new(1),
            links: TaskTracker::new(),
        }))
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::SessionClosed)
        } else if self.connection.is_closed() {
            Err(Error::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn next_link_id(&self) -> u64 {
        self.next_link.fetch_add(1, Ordering::Relaxed)
    }

    fn link_name(&self, role: &str) -> String {
        format!(
            "{}-{}-{}-{}",
            self.connection.client_id,
            self.id,
            role,
            self.next_link_id()
        )
    }

    pub(crate) async fn attach_sender(&self, destination: &Destination) -> Result<Box<dyn LinkSender>> {
        self.check_open()?;
        let name = self.link_name("sender");
        let mut transport = self.transport.lock().await;
        let transport = transport.as_mut().ok_or(Error::SessionClosed)?;
        transport
            .attach_sender(name, destination)
            .await
            .map_err(|err| {
                self.connection.report(&err);
                Error::from(err)
            })
    }

    pub(crate) async fn attach_receiver(&self, destination: &Destination) -> Result<Box<dyn LinkReceiver>> {
        self.check_open()?;
        if let Destination::TemporaryQueue(queue) = destination {
            if !self.connection.owns_temporary_queue(queue).await {
                return Err(Error::InvalidDestination(format!(
                    "{} is not a live temporary queue of this connection",
                    queue.name()
                )));
            }
        }

        let name = self.link_name("receiver");
        let mut transport = self.transport.lock().await;
        let transport = transport.as_mut().ok_or(Error::SessionClosed)?;
        transport
            .attach_receiver(name, destination, self.connection.prefetch)
            .await
            .map_err(|err| {
                self.connection.report(&err);
                Error::from(err)
            })
    }

    pub(crate) fn spawn_link<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.links.spawn(task);
    }

    pub(crate) fn register_consumer(&self, consumer: Arc<ConsumerShared>) {
        self.consumers.lock().insert(consumer.id, consumer);
    }

    pub(crate) fn remove_consumer(&self, id: u64) {
        self.consumers.lock().remove(&id);
    }

    /// Waits until the listener running right now, if any, has returned
    pub(crate) async fn barrier(&self) {
        let (done, reached) = oneshot::channel();
        if self.dispatcher.send(DispatchCommand::Barrier(done)).is_ok() {
            let _ = reached.await;
        }
    }

    pub(crate) async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Releases are queued on the link tasks before they are told to detach
        self.acks.close();
        let consumers: Vec<Arc<ConsumerShared>> =
            self.consumers.lock().drain().map(|(_, c)| c).collect();
        for consumer in &consumers {
            consumer::shut_down(consumer);
        }
        self.cancel.cancel();
        self.links.close();
        self.links.wait().await;

        let transport = self.transport.lock().await.take();
        if let Some(mut transport) = transport {
            if let Err(_err) = transport.end().await {
                #[cfg(feature = "tracing")]
                tracing::debug!(session = self.id, "error ending session: {}", _err);
                #[cfg(feature = "log")]
                log::debug!("error ending session {}: {}", self.id, _err);
            }
        }
        self.connection.forget_session(self);

        #[cfg(feature = "tracing")]
        tracing::debug!(session = self.id, "session closed");
        #[cfg(feature = "log")]
        log::debug!("session {} closed", self.id);
        Ok(())
    }
}

/// A single-threaded context for producing and consuming messages
///
/// Sessions are non-transacted. The listeners of the consumers of one session never run
/// concurrently.
#[derive(Debug)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<SessionInner> {
        &self.inner
    }

    /// The acknowledgement mode the session was created with
    pub fn ack_mode(&self) -> AckMode {
        self.inner.mode
    }

    /// Always `false`
    pub fn is_transacted(&self) -> bool {
        false
    }

    /// Creates a producer
    ///
    /// With `None` the producer is unbound and every send must name its destination.
    pub async fn create_producer(&self, destination: impl Into<Option<Destination>>) -> Result<Producer> {
        self.inner.check_open()?;
        Producer::attach(self.inner.clone(), destination.into()).await
    }

    /// Creates a consumer on the destination
    ///
    /// A temporary queue can only be consumed by the connection that created it, and only
    /// until it is deleted; anything else fails with [`Error::InvalidDestination`].
    pub async fn create_consumer(&self, destination: impl Into<Destination>) -> Result<Consumer> {
        self.inner.check_open()?;
        Consumer::attach(self.inner.clone(), destination.into()).await
    }

    /// Asks the broker for a uniquely named queue that lives as long as the connection
    pub async fn create_temporary_queue(&self) -> Result<TemporaryQueue> {
        self.inner.check_open()?;
        self.inner.connection.create_temporary_queue().await
    }

    /// Deletes a temporary queue created by this connection before the connection closes
    pub async fn delete_temporary_queue(&self, queue: &TemporaryQueue) -> Result<()> {
        self.inner.check_open()?;
        self.inner.connection.delete_temporary_queue(queue).await
    }

    /// Creates a handle to a queue provisioned on the broker
    pub fn create_queue(&self, name: impl Into<String>) -> Result<Queue> {
        self.inner.check_open()?;
        Ok(Queue::new(name))
    }

    /// Creates a handle to a topic
    pub fn create_topic(&self, name: impl Into<String>) -> Result<Topic> {
        self.inner.check_open()?;
        Ok(Topic::new(name))
    }

    /// Creates a text message
    pub fn create_text_message(&self, text: impl Into<String>) -> Result<Message> {
        self.inner.check_open()?;
        Ok(Message::text(text))
    }

    /// Gives every unacknowledged message of this session back to the broker, which redelivers
    /// them with the redelivered flag set
    pub fn recover(&self) -> Result<()> {
        self.inner.check_open()?;
        self.inner.acks.release_all();
        Ok(())
    }

    /// Closes the session with its producers and consumers
    ///
    /// Unacknowledged messages are redelivered by the broker. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

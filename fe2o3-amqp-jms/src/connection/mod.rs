//! Connection to the broker

use std::{
    collections::HashMap,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    destination::{ConnectionId, TemporaryQueue},
    error::{Error, Result},
    session::{AckMode, Session, SessionInner},
    transport::{
        Binding, ConnectOptions, LinkSender, Transport, TransportError, TransportSession,
    },
};

mod pump;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a [`Connection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Open, but no message is delivered until [`Connection::start`]
    Created,
    /// Messages flow to consumers
    Started,
    /// Delivery is suspended
    Stopped,
    /// Terminal
    Closed,
}

/// Handler for errors that happen outside of any call, such as the broker closing the
/// connection or the socket dropping
///
/// The connection is already closed when the handler runs. Implemented for any
/// `Fn(Error) + Send + Sync` closure.
pub trait ExceptionListener: Send + Sync + 'static {
    /// Called once, from a runtime worker, with the error that closed the connection
    fn on_exception(&self, error: Error);
}

impl<F> ExceptionListener for F
where
    F: Fn(Error) + Send + Sync + 'static,
{
    fn on_exception(&self, error: Error) {
        (self)(error)
    }
}

/// Temporary queues are anchored on a connection level session so that they live as long as the
/// connection rather than the session that asked for them
#[derive(Default)]
struct TemporaryQueues {
    session: Option<Box<dyn TransportSession>>,
    anchors: HashMap<String, Box<dyn LinkSender>>,
}

pub(crate) struct ConnectionInner {
    pub(crate) id: ConnectionId,
    pub(crate) client_id: String,
    pub(crate) prefetch: u32,
    state: Mutex<ConnectionState>,
    started: watch::Sender<bool>,
    pub(crate) cancel: CancellationToken,
    transport: tokio::sync::Mutex<Option<Box<dyn Transport>>>,
    temporary: tokio::sync::Mutex<TemporaryQueues>,
    sessions: Mutex<Vec<Weak<SessionInner>>>,
    exception_listener: Mutex<Option<Arc<dyn ExceptionListener>>>,
    failures: mpsc::UnboundedSender<TransportError>,
}

impl fmt::Debug for ConnectionInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInner")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("prefetch", &self.prefetch)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl ConnectionInner {
    pub(crate) fn is_closed(&self) -> bool {
        *self.state.lock() == ConnectionState::Closed
    }

    pub(crate) fn started(&self) -> watch::Receiver<bool> {
        self.started.subscribe()
    }

    /// Reports a transport failure seen by a link. Only a lost connection is fatal.
    pub(crate) fn report(&self, error: &TransportError) {
        if let TransportError::ConnectionLost(_) = error {
            let _ = self.failures.send(error.clone());
        }
    }

    pub(crate) async fn begin_session(&self) -> Result<Box<dyn TransportSession>> {
        let mut transport = self.transport.lock().await;
        let transport = transport.as_mut().ok_or(Error::ConnectionClosed)?;
        transport.begin().await.map_err(|err| {
            self.report(&err);
            Error::from(err)
        })
    }

    /// Closes the connection after an unsolicited failure and notifies the exception listener
    pub(crate) fn fail(&self, failure: TransportError) {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }
        self.started.send_replace(false);
        self.cancel.cancel();

        #[cfg(feature = "tracing")]
        tracing::warn!(connection = ?self.id, "connection failed: {}", failure);
        #[cfg(feature = "log")]
        log::warn!("connection {:?} failed: {}", self.id, failure);

        let listener = self.exception_listener.lock().take();
        if let Some(listener) = listener {
            let error = Error::from(failure);
            if catch_unwind(AssertUnwindSafe(|| listener.on_exception(error))).is_err() {
                #[cfg(feature = "tracing")]
                tracing::error!(connection = ?self.id, "exception listener panicked");
                #[cfg(feature = "log")]
                log::error!("exception listener of connection {:?} panicked", self.id);
            }
        }
    }

    pub(crate) async fn create_temporary_queue(&self) -> Result<TemporaryQueue> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let mut temporary = self.temporary.lock().await;
        if temporary.session.is_none() {
            temporary.session = Some(self.begin_session().await?);
        }
        let session = temporary.session.as_mut().ok_or(Error::ConnectionClosed)?;
        let link_name = format!("{}-temp-queue-{}", self.client_id, uuid::Uuid::new_v4());
        let (address, anchor) = session.create_temporary_queue(link_name).await.map_err(|err| {
            self.report(&err);
            Error::from(err)
        })?;
        temporary.anchors.insert(address.clone(), anchor);
        Ok(TemporaryQueue::owned(address, self.id))
    }

    pub(crate) async fn owns_temporary_queue(&self, queue: &TemporaryQueue) -> bool {
        queue.owner() == Some(self.id) && self.temporary.lock().await.anchors.contains_key(queue.name())
    }

    pub(crate) async fn delete_temporary_queue(&self, queue: &TemporaryQueue) -> Result<()> {
        if queue.owner() != Some(self.id) {
            return Err(Error::InvalidDestination(format!(
                "{} belongs to another connection",
                queue.name()
            )));
        }
        let anchor = self.temporary.lock().await.anchors.remove(queue.name());
        match anchor {
            Some(mut anchor) => anchor.close().await.map_err(Error::from),
            None => Err(Error::InvalidDestination(format!(
                "{} was already deleted",
                queue.name()
            ))),
        }
    }

    fn register_session(&self, session: &Arc<SessionInner>) {
        let mut sessions = self.sessions.lock();
        sessions.retain(|weak| weak.strong_count() > 0);
        sessions.push(Arc::downgrade(session));
    }

    pub(crate) fn forget_session(&self, session: &SessionInner) {
        self.sessions
            .lock()
            .retain(|weak| weak.upgrade().map(|s| !std::ptr::eq(&*s, session)).unwrap_or(false));
    }

    fn live_sessions(&self) -> Vec<Arc<SessionInner>> {
        self.sessions.lock().iter().filter_map(Weak::upgrade).collect()
    }
}

/// An open connection to the broker
///
/// The handle is cheap to clone; all clones refer to the same connection. Delivery to consumers
/// only happens between [`Connection::start`] and [`Connection::stop`] or
/// [`Connection::close`].
///
/// # Example
///
/// ```rust,ignore
/// let connection = factory.create_connection().await?;
/// let session = connection.create_session(AckMode::AutoAck).await?;
/// connection.start()?;
/// // ...
/// connection.close().await?;
/// ```
#[derive(Debug, Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) async fn open(
        binding: &dyn Binding,
        options: ConnectOptions<'_>,
        prefetch: u32,
    ) -> Result<Self> {
        let mut transport = binding.connect(options.clone()).await?;

        let id = ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed));
        let (started, _) = watch::channel(false);
        let (failures, failures_rx) = mpsc::unbounded_channel();
        let external = transport.take_failures();
        let cancel = CancellationToken::new();

        let inner = Arc::new(ConnectionInner {
            id,
            client_id: options.container_id.to_string(),
            prefetch,
            state: Mutex::new(ConnectionState::Created),
            started,
            cancel: cancel.clone(),
            transport: tokio::sync::Mutex::new(Some(transport)),
            temporary: tokio::sync::Mutex::new(TemporaryQueues::default()),
            sessions: Mutex::new(Vec::new()),
            exception_listener: Mutex::new(None),
            failures,
        });

        tokio::spawn(pump::failure_pump(
            Arc::downgrade(&inner),
            failures_rx,
            external,
            cancel,
        ));

        #[cfg(feature = "tracing")]
        tracing::info!(connection = ?id, url = %options.url, "connection opened");
        #[cfg(feature = "log")]
        log::info!("connection {:?} opened to {}", id, options.url);

        Ok(Self { inner })
    }

    /// Identifies this connection as the owner of temporary queues
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Client id, announced to the broker as the container id
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Registers the handler for asynchronous failures, replacing any earlier one
    pub fn set_exception_listener(&self, listener: impl ExceptionListener) -> Result<()> {
        if self.inner.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        *self.inner.exception_listener.lock() = Some(Arc::new(listener));
        Ok(())
    }

    /// Starts (or resumes) delivery of messages to consumers
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state == ConnectionState::Closed {
                return Err(Error::ConnectionClosed);
            }
            *state = ConnectionState::Started;
        }
        self.inner.started.send_replace(true);
        Ok(())
    }

    /// Suspends delivery of messages to consumers
    ///
    /// Returns once listener invocations that were already running have completed. Must not be
    /// awaited from inside a message listener.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state == ConnectionState::Closed {
                return Err(Error::ConnectionClosed);
            }
            *state = ConnectionState::Stopped;
        }
        self.inner.started.send_replace(false);

        for session in self.inner.live_sessions() {
            session.barrier().await;
        }
        Ok(())
    }

    /// Creates a non-transacted session with the given acknowledgement mode
    pub async fn create_session(&self, mode: AckMode) -> Result<Session> {
        if self.inner.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let session = SessionInner::begin(self.inner.clone(), mode).await?;
        self.inner.register_session(&session);
        Ok(Session::from_inner(session))
    }

    /// Closes every session, deletes the temporary queues of this connection and closes the
    /// transport
    ///
    /// Idempotent. A receive that is pending on any consumer of this connection returns
    /// [`Error::ConsumerClosed`].
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            *state = ConnectionState::Closed;
        }
        inner.started.send_replace(false);
        inner.exception_listener.lock().take();

        let sessions: Vec<Arc<SessionInner>> = inner
            .sessions
            .lock()
            .drain(..)
            .filter_map(|weak| weak.upgrade())
            .collect();
        for session in sessions {
            let _ = session.close().await;
        }
        inner.cancel.cancel();

        let temporary = std::mem::take(&mut *inner.temporary.lock().await);
        for (_, mut anchor) in temporary.anchors {
            let _ = anchor.close().await;
        }
        if let Some(mut session) = temporary.session {
            let _ = session.end().await;
        }

        let transport = inner.transport.lock().await.take();
        if let Some(mut transport) = transport {
            if let Err(_err) = transport.close().await {
                #[cfg(feature = "tracing")]
                tracing::debug!(connection = ?inner.id, "error closing transport: {}", _err);
                #[cfg(feature = "log")]
                log::debug!("error closing transport of {:?}: {}", inner.id, _err);
            }

            #[cfg(feature = "tracing")]
            tracing::info!(connection = ?inner.id, "connection closed");
            #[cfg(feature = "log")]
            log::info!("connection {:?} closed", inner.id);
        }
        Ok(())
    }
}

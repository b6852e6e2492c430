//! Message consumer

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    connection::ConnectionInner,
    destination::Destination,
    error::{Error, Result},
    message::{now_millis, Message},
    session::{
        ack::{AckHandle, AckTracker, LinkCommand},
        dispatcher::DispatchCommand,
        AckMode, SessionInner,
    },
    transport::{DeliveryTag, Disposition, Inbound, LinkReceiver, TransportError},
};

/// Asynchronous message handler
///
/// Implemented for any `Fn(Message) + Send + Sync` closure. The listeners of one session are
/// invoked one at a time from the session's dispatcher task, so a listener should return
/// quickly and must not block on a receive of the same session.
pub trait MessageListener: Send + Sync + 'static {
    /// Handles one message. In auto acknowledge mode the message is acknowledged when this
    /// returns; a panic releases it for redelivery instead.
    fn on_message(&self, message: Message);
}

impl<F> MessageListener for F
where
    F: Fn(Message) + Send + Sync + 'static,
{
    fn on_message(&self, message: Message) {
        (self)(message)
    }
}

/// What has to happen to a delivery once the application is done with it
#[derive(Debug, Clone, Copy)]
pub(crate) struct Delivered {
    tag: DeliveryTag,
    seq: Option<u64>,
}

pub(crate) struct ConsumerShared {
    pub(crate) id: u64,
    destination: Destination,
    mode: AckMode,
    acks: Arc<AckTracker>,
    link: mpsc::UnboundedSender<LinkCommand>,
    inbox: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    listening: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,
    terminal: Mutex<Option<Error>>,
    dispatcher: mpsc::UnboundedSender<DispatchCommand>,
}

impl fmt::Debug for ConsumerShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerShared")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("mode", &self.mode)
            .field("listening", &self.listening)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl ConsumerShared {
    pub(crate) fn destination(&self) -> &Destination {
        &self.destination
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn settle(&self, tag: DeliveryTag, disposition: Disposition) {
        let _ = self.link.send(LinkCommand::Settle(tag, disposition));
    }

    /// Turns a delivery into a message for the application, or drops it if it expired in flight
    pub(crate) fn admit(&self, inbound: Inbound) -> Option<(Message, Delivered)> {
        let Inbound { tag, mut message } = inbound;
        if message.is_expired_at(now_millis()) {
            #[cfg(feature = "tracing")]
            tracing::debug!(destination = %self.destination, id = ?message.message_id(), "dropping expired message");
            #[cfg(feature = "log")]
            log::debug!("dropping expired message {:?} from {}", message.message_id(), self.destination);
            self.settle(tag, Disposition::Accepted);
            return None;
        }

        let seq = match self.mode {
            AckMode::ClientAck => {
                let seq = self.acks.track(self.id, tag, self.link.clone());
                message.ack = Some(AckHandle::new(self.acks.clone(), seq));
                Some(seq)
            }
            AckMode::AutoAck | AckMode::DupsOkAck => None,
        };
        Some((message, Delivered { tag, seq }))
    }

    /// The application consumed the message
    pub(crate) fn complete(&self, delivered: Delivered) {
        if delivered.seq.is_none() {
            self.settle(delivered.tag, Disposition::Accepted);
        }
    }

    /// The application failed on the message
    pub(crate) fn abandon(&self, delivered: Delivered) {
        match delivered.seq {
            Some(seq) => self.acks.release(seq),
            None => self.settle(delivered.tag, Disposition::Released),
        }
    }

    fn closed_error(&self) -> Error {
        self.terminal.lock().clone().unwrap_or(Error::ConsumerClosed)
    }

    fn check_receive(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConsumerClosed);
        }
        if self.listening.load(Ordering::Acquire) {
            return Err(Error::IllegalMode(
                "receive called on a consumer with a message listener",
            ));
        }
        Ok(())
    }

    /// Waits for the next delivery while the connection is started. Cancel safe.
    async fn next_inbound(
        &self,
        inbox: &mut mpsc::UnboundedReceiver<Inbound>,
        started: &mut watch::Receiver<bool>,
    ) -> Result<Inbound> {
        loop {
            if !*started.borrow_and_update() {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(self.closed_error()),
                    changed = started.changed() => match changed {
                        Ok(()) => continue,
                        Err(_) => return Err(self.closed_error()),
                    },
                }
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(self.closed_error()),
                changed = started.changed() => {
                    if changed.is_err() {
                        return Err(self.closed_error());
                    }
                }
                inbound = inbox.recv() => match inbound {
                    Some(inbound) => return Ok(inbound),
                    None => return Err(self.closed_error()),
                },
            }
        }
    }

    /// Fails later receives and listener deliveries. Returns false if already closed.
    fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Wakes a pending receive and detaches the link once queued settlements are sent
    pub(crate) fn detach(&self, done: Option<oneshot::Sender<()>>) {
        self.cancel.cancel();
        let _ = self.link.send(LinkCommand::Close(done));
    }
}

/// Receives messages from one destination, either synchronously through the `receive` family
/// or asynchronously through a [`MessageListener`]
///
/// Messages are handed out in the order the broker delivered them. The two modes are exclusive:
/// once a listener is set, [`Consumer::receive`] fails with [`Error::IllegalMode`].
pub struct Consumer {
    shared: Arc<ConsumerShared>,
    session: Arc<SessionInner>,
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer").field("shared", &self.shared).finish()
    }
}

impl Consumer {
    pub(crate) async fn attach(session: Arc<SessionInner>, destination: Destination) -> Result<Self> {
        let link = session.attach_receiver(&destination).await?;

        let id = session.next_link_id();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let cancel = session.cancel.child_token();

        let shared = Arc::new(ConsumerShared {
            id,
            destination,
            mode: session.mode,
            acks: session.acks.clone(),
            link: commands,
            inbox: tokio::sync::Mutex::new(Some(inbox)),
            listening: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel: cancel.clone(),
            terminal: Mutex::new(None),
            dispatcher: session.dispatcher.clone(),
        });

        session.spawn_link(link_worker(
            link,
            commands_rx,
            inbox_tx,
            cancel,
            Arc::downgrade(&shared),
            Arc::downgrade(&session.connection),
        ));
        session.register_consumer(shared.clone());

        Ok(Self { shared, session })
    }

    /// The destination this consumer receives from
    pub fn destination(&self) -> &Destination {
        &self.shared.destination
    }

    /// Waits for the next message
    ///
    /// Fails with [`Error::ConsumerClosed`] when the consumer, its session or its connection is
    /// closed while waiting. Dropping the returned future loses no message.
    pub async fn receive(&self) -> Result<Message> {
        self.shared.check_receive()?;
        let mut guard = self.shared.inbox.lock().await;
        let inbox = guard.as_mut().ok_or(Error::IllegalMode(
            "receive called on a consumer with a message listener",
        ))?;
        let mut started = self.session.connection.started();

        loop {
            let inbound = self.shared.next_inbound(inbox, &mut started).await?;
            if let Some((message, delivered)) = self.shared.admit(inbound) {
                self.shared.complete(delivered);
                return Ok(message);
            }
        }
    }

    /// Waits at most `timeout` for the next message. A zero timeout behaves like
    /// [`Consumer::receive_no_wait`].
    pub async fn receive_timeout(&self, timeout: Duration) -> Result<Option<Message>> {
        if timeout.is_zero() {
            return self.receive_no_wait();
        }
        match tokio::time::timeout(timeout, self.receive()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Waits for the next message until `interrupt` is cancelled
    ///
    /// Fails with [`Error::Interrupted`] once the token is cancelled; no message is lost.
    pub async fn receive_interruptible(&self, interrupt: &CancellationToken) -> Result<Message> {
        tokio::select! {
            biased;
            _ = interrupt.cancelled() => Err(Error::Interrupted),
            result = self.receive() => result,
        }
    }

    /// Returns a message only if one is immediately available
    pub fn receive_no_wait(&self) -> Result<Option<Message>> {
        self.shared.check_receive()?;
        let mut guard = match self.shared.inbox.try_lock() {
            Ok(guard) => guard,
            Err(_) => return Ok(None),
        };
        let Some(inbox) = guard.as_mut() else {
            return Err(Error::IllegalMode(
                "receive called on a consumer with a message listener",
            ));
        };
        if !*self.session.connection.started().borrow() {
            return Ok(None);
        }

        loop {
            match inbox.try_recv() {
                Ok(inbound) => {
                    if let Some((message, delivered)) = self.shared.admit(inbound) {
                        self.shared.complete(delivered);
                        return Ok(Some(message));
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => return Ok(None),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Err(self.shared.closed_error())
                }
            }
        }
    }

    /// Switches the consumer to asynchronous delivery, replacing any earlier listener
    ///
    /// Fails with [`Error::IllegalMode`] while a synchronous receive is pending.
    pub fn set_message_listener(&self, listener: impl MessageListener) -> Result<()> {
        if self.shared.is_closed() {
            return Err(Error::ConsumerClosed);
        }
        let listener: Arc<dyn MessageListener> = Arc::new(listener);

        let inbox = match self.shared.inbox.try_lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => {
                return Err(Error::IllegalMode(
                    "a synchronous receive is pending on this consumer",
                ))
            }
        };
        self.shared.listening.store(true, Ordering::Release);

        self.shared
            .dispatcher
            .send(DispatchCommand::Register {
                consumer: self.shared.clone(),
                inbox,
                listener,
            })
            .map_err(|_| Error::SessionClosed)
    }

    /// Closes the consumer
    ///
    /// A pending receive returns [`Error::ConsumerClosed`]. Returns after a listener invocation
    /// that is in progress has completed; must therefore not be awaited from inside a listener
    /// of the same session. Unacknowledged messages go back to the broker.
    pub async fn close(&self) -> Result<()> {
        if !self.shared.mark_closed() {
            return Ok(());
        }

        // The link stays attached until the running listener has settled its delivery
        if self.shared.listening.load(Ordering::Acquire) {
            let (done, joined) = oneshot::channel();
            let unregister = DispatchCommand::Unregister {
                consumer: self.shared.id,
                done: Some(done),
                detach: false,
            };
            if self.shared.dispatcher.send(unregister).is_ok() {
                let _ = joined.await;
            }
        }

        let (done, detached) = oneshot::channel();
        self.shared.detach(Some(done));
        let _ = detached.await;

        self.shared.acks.forget_consumer(self.shared.id);
        self.session.remove_consumer(self.shared.id);
        Ok(())
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if !self.shared.mark_closed() {
            return;
        }
        let unregister = DispatchCommand::Unregister {
            consumer: self.shared.id,
            done: None,
            detach: true,
        };
        let handed_over = self.shared.listening.load(Ordering::Acquire)
            && self.shared.dispatcher.send(unregister).is_ok();
        if !handed_over {
            self.shared.detach(None);
        }
        self.shared.acks.forget_consumer(self.shared.id);
        self.session.remove_consumer(self.shared.id);
    }
}

/// Marks the consumers of a closing session as closed
pub(crate) fn shut_down(consumer: &ConsumerShared) {
    consumer.mark_closed();
    consumer.cancel.cancel();
}

/// Owns the receiving link of one consumer
///
/// Forwards deliveries to the consumer inbox and executes settle and close commands. Commands
/// take priority so that releases issued before a close reach the broker first.
async fn link_worker(
    mut link: Box<dyn LinkReceiver>,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    inbox: mpsc::UnboundedSender<Inbound>,
    cancel: CancellationToken,
    consumer: Weak<ConsumerShared>,
    connection: Weak<ConnectionInner>,
) {
    loop {
        tokio::select! {
            biased;
            command = commands.recv() => match command {
                Some(LinkCommand::Settle(tag, disposition)) => {
                    if let Err(_err) = link.settle(tag, disposition).await {
                        #[cfg(feature = "tracing")]
                        tracing::debug!("failed to settle delivery {}: {}", tag, _err);
                        #[cfg(feature = "log")]
                        log::debug!("failed to settle delivery {}: {}", tag, _err);
                    }
                }
                Some(LinkCommand::Close(done)) => {
                    let _ = link.close().await;
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                    return;
                }
                None => {
                    let _ = link.close().await;
                    return;
                }
            },
            _ = cancel.cancelled() => {
                let _ = link.close().await;
                return;
            }
            inbound = link.recv() => match inbound {
                Ok(inbound) => {
                    if let Err(mpsc::error::SendError(inbound)) = inbox.send(inbound) {
                        let _ = link.settle(inbound.tag, Disposition::Released).await;
                    }
                }
                Err(err) => {
                    if let Some(connection) = connection.upgrade() {
                        connection.report(&err);
                    }
                    if let Some(consumer) = consumer.upgrade() {
                        let terminal = match &err {
                            TransportError::ConnectionLost(_) => Error::ConsumerClosed,
                            _ => Error::from(err.clone()),
                        };
                        *consumer.terminal.lock() = Some(terminal);
                    }
                    #[cfg(feature = "tracing")]
                    tracing::warn!("receiving link terminated: {}", err);
                    #[cfg(feature = "log")]
                    log::warn!("receiving link terminated: {}", err);
                    return;
                }
            },
        }
    }
}

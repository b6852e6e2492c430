//! Message producer

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::Arc,
    time::Duration,
};

use uuid::Uuid;

use crate::{
    destination::Destination,
    error::{Error, Result},
    message::{expiration_after, now_millis, DeliveryMode, Message, DEFAULT_PRIORITY, DEFAULT_TIME_TO_LIVE},
    session::SessionInner,
    transport::{LinkSender, TransportError},
};

/// Links an unbound producer keeps attached; the least recently used one is detached first
const MAX_CACHED_LINKS: usize = 16;

/// Per-send overrides of the producer defaults
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Delivery mode, or the producer default
    pub delivery_mode: Option<DeliveryMode>,

    /// Priority, or the producer default
    pub priority: Option<u8>,

    /// Time-to-live, or the producer default. Zero never expires.
    pub time_to_live: Option<Duration>,
}

impl SendOptions {
    /// No overrides
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the delivery mode
    pub fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = Some(mode);
        self
    }

    /// Overrides the priority
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Overrides the time-to-live
    pub fn time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }
}

/// Sends messages, either to the destination it was created for or, if unbound, to the
/// destination named on each send
///
/// A producer is meant to be used by one task at a time, which the `&mut self` receivers
/// enforce. Taking the [`Message`] by value makes it immutable once submitted.
pub struct Producer {
    session: Arc<SessionInner>,
    destination: Option<Destination>,
    links: HashMap<Destination, Box<dyn LinkSender>>,
    recently_used: VecDeque<Destination>,
    delivery_mode: DeliveryMode,
    priority: u8,
    time_to_live: Duration,
    closed: bool,
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("destination", &self.destination)
            .field("links", &self.links.keys().collect::<Vec<_>>())
            .field("delivery_mode", &self.delivery_mode)
            .field("priority", &self.priority)
            .field("time_to_live", &self.time_to_live)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Producer {
    pub(crate) async fn attach(session: Arc<SessionInner>, destination: Option<Destination>) -> Result<Self> {
        let mut links = HashMap::new();
        if let Some(destination) = &destination {
            let link = session.attach_sender(destination).await?;
            links.insert(destination.clone(), link);
        }
        Ok(Self {
            session,
            destination,
            links,
            recently_used: VecDeque::new(),
            delivery_mode: DeliveryMode::default(),
            priority: DEFAULT_PRIORITY,
            time_to_live: DEFAULT_TIME_TO_LIVE,
            closed: false,
        })
    }

    /// The destination of a bound producer
    pub fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    /// Default delivery mode
    pub fn delivery_mode(&self) -> DeliveryMode {
        self.delivery_mode
    }

    /// Sets the default delivery mode
    pub fn set_delivery_mode(&mut self, mode: DeliveryMode) {
        self.delivery_mode = mode;
    }

    /// Default priority
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Sets the default priority
    pub fn set_priority(&mut self, priority: u8) {
        self.priority = priority;
    }

    /// Default time-to-live
    pub fn time_to_live(&self) -> Duration {
        self.time_to_live
    }

    /// Sets the default time-to-live. Zero never expires.
    pub fn set_time_to_live(&mut self, ttl: Duration) {
        self.time_to_live = ttl;
    }

    /// Sends to the bound destination with the producer defaults
    ///
    /// Fails with [`Error::UnresolvedDestination`] on an unbound producer.
    pub async fn send(&mut self, message: Message) -> Result<()> {
        self.send_with(message, SendOptions::default()).await
    }

    /// Sends to the bound destination with per-send overrides
    pub async fn send_with(&mut self, message: Message, options: SendOptions) -> Result<()> {
        let destination = self
            .destination
            .clone()
            .ok_or(Error::UnresolvedDestination)?;
        self.transfer(destination, message, options).await
    }

    /// Sends to an explicit destination; only valid on an unbound producer
    pub async fn send_to(&mut self, destination: impl Into<Destination>, message: Message) -> Result<()> {
        self.send_to_with(destination, message, SendOptions::default())
            .await
    }

    /// Sends to an explicit destination with per-send overrides
    pub async fn send_to_with(
        &mut self,
        destination: impl Into<Destination>,
        message: Message,
        options: SendOptions,
    ) -> Result<()> {
        if self.destination.is_some() {
            return Err(Error::UnsupportedOperation(
                "explicit destination on a producer bound to a destination",
            ));
        }
        self.transfer(destination.into(), message, options).await
    }

    async fn transfer(&mut self, destination: Destination, mut message: Message, options: SendOptions) -> Result<()> {
        if self.closed {
            return Err(Error::ProducerClosed);
        }
        self.session.check_open()?;

        let delivery_mode = options.delivery_mode.unwrap_or(self.delivery_mode);
        let time_to_live = options.time_to_live.unwrap_or(self.time_to_live);
        let now = now_millis();

        message.prepare_for_send();
        message.message_id = Some(format!("ID:{}", Uuid::new_v4()));
        message.destination = Some(destination.clone());
        message.delivery_mode = delivery_mode;
        message.priority = options.priority.unwrap_or(self.priority);
        message.time_to_live = time_to_live;
        message.timestamp = Some(now);
        message.expiration = expiration_after(now, time_to_live);

        if !self.links.contains_key(&destination) {
            let link = self.session.attach_sender(&destination).await?;
            self.evict_idle_links().await;
            self.links.insert(destination.clone(), link);
        }
        if self.destination.is_none() {
            self.recently_used.retain(|used| *used != destination);
            self.recently_used.push_back(destination.clone());
        }
        let link = self
            .links
            .get_mut(&destination)
            .ok_or(Error::ProducerClosed)?;

        let settled = delivery_mode == DeliveryMode::NonPersistent;
        match link.send(&message, settled).await {
            Ok(()) => Ok(()),
            // A rejected outcome leaves the link usable
            Err(err @ TransportError::Rejected(_)) => Err(Error::from(err)),
            Err(err) => {
                self.session.connection.report(&err);
                self.forget_link(&destination).await;
                Err(Error::from(err))
            }
        }
    }

    /// Drops a link that failed; the next send to the destination attaches a new one
    async fn forget_link(&mut self, destination: &Destination) {
        self.recently_used.retain(|used| used != destination);
        if let Some(mut link) = self.links.remove(destination) {
            let _ = link.close().await;
        }
    }

    async fn evict_idle_links(&mut self) {
        if self.destination.is_some() {
            return;
        }
        while self.links.len() >= MAX_CACHED_LINKS {
            let Some(oldest) = self.recently_used.pop_front() else {
                break;
            };
            if let Some(mut link) = self.links.remove(&oldest) {
                let _ = link.close().await;
            }
        }
    }

    /// Number of links currently attached to the broker
    pub fn attached_links(&self) -> usize {
        self.links.len()
    }

    /// Detaches the links of this producer. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.recently_used.clear();
        for (_, mut link) in self.links.drain() {
            let _ = link.close().await;
        }
        Ok(())
    }
}

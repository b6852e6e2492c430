//! Queues, topics and temporary queues

use std::fmt;

/// Identifies the connection that owns a temporary queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

/// A pre-provisioned point-to-point destination
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Queue {
    name: String,
}

impl Queue {
    /// Creates a queue handle for the given logical name
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The logical name of the queue
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A publish/subscribe destination with a `/` separated hierarchical name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    name: String,
}

impl Topic {
    /// Creates a topic handle for the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The full topic name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Iterates over the `/` separated levels of the topic name
    pub fn levels(&self) -> impl Iterator<Item = &str> {
        self.name.split('/')
    }
}

/// A broker-named queue that lives as long as the connection that created it
///
/// Two temporary queues are the same destination when their broker assigned names are equal.
/// The owner is only known for queues created locally; a temporary queue decoded from the
/// `reply-to` of a received message has no owner on this side.
#[derive(Debug, Clone)]
pub struct TemporaryQueue {
    name: String,
    owner: Option<ConnectionId>,
}

impl TemporaryQueue {
    pub(crate) fn owned(name: impl Into<String>, owner: ConnectionId) -> Self {
        Self {
            name: name.into(),
            owner: Some(owner),
        }
    }

    /// Creates a handle to a temporary queue created by some other connection
    pub fn remote(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: None,
        }
    }

    /// The broker assigned name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The connection that created this queue, if it was created locally
    pub fn owner(&self) -> Option<ConnectionId> {
        self.owner
    }
}

impl PartialEq for TemporaryQueue {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for TemporaryQueue {}

impl std::hash::Hash for TemporaryQueue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state)
    }
}

/// The kind of a destination, as carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestinationKind {
    /// [`Queue`]
    Queue,
    /// [`Topic`]
    Topic,
    /// [`TemporaryQueue`]
    TemporaryQueue,
}

/// Where a message is sent to or received from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// Point-to-point
    Queue(Queue),

    /// Publish/subscribe
    Topic(Topic),

    /// Broker named, connection scoped queue
    TemporaryQueue(TemporaryQueue),
}

impl Destination {
    /// Shorthand for a [`Destination::Queue`]
    pub fn queue(name: impl Into<String>) -> Self {
        Self::Queue(Queue::new(name))
    }

    /// Shorthand for a [`Destination::Topic`]
    pub fn topic(name: impl Into<String>) -> Self {
        Self::Topic(Topic::new(name))
    }

    /// The name of the destination regardless of its kind
    pub fn name(&self) -> &str {
        match self {
            Destination::Queue(queue) => queue.name(),
            Destination::Topic(topic) => topic.name(),
            Destination::TemporaryQueue(queue) => queue.name(),
        }
    }

    /// The kind of the destination
    pub fn kind(&self) -> DestinationKind {
        match self {
            Destination::Queue(_) => DestinationKind::Queue,
            Destination::Topic(_) => DestinationKind::Topic,
            Destination::TemporaryQueue(_) => DestinationKind::TemporaryQueue,
        }
    }

    /// Rebuilds a destination from a name and a kind decoded off the wire
    pub fn from_parts(name: impl Into<String>, kind: DestinationKind) -> Self {
        match kind {
            DestinationKind::Queue => Self::queue(name),
            DestinationKind::Topic => Self::topic(name),
            DestinationKind::TemporaryQueue => Self::TemporaryQueue(TemporaryQueue::remote(name)),
        }
    }

    /// Whether the destination is a [`TemporaryQueue`]
    pub fn is_temporary(&self) -> bool {
        matches!(self, Destination::TemporaryQueue(_))
    }
}

impl From<Queue> for Destination {
    fn from(value: Queue) -> Self {
        Self::Queue(value)
    }
}

impl From<Topic> for Destination {
    fn from(value: Topic) -> Self {
        Self::Topic(value)
    }
}

impl From<TemporaryQueue> for Destination {
    fn from(value: TemporaryQueue) -> Self {
        Self::TemporaryQueue(value)
    }
}

impl From<&TemporaryQueue> for Destination {
    fn from(value: &TemporaryQueue) -> Self {
        Self::TemporaryQueue(value.clone())
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Queue(queue) => write!(f, "queue://{}", queue.name()),
            Destination::Topic(topic) => write!(f, "topic://{}", topic.name()),
            Destination::TemporaryQueue(queue) => write!(f, "temp-queue://{}", queue.name()),
        }
    }
}

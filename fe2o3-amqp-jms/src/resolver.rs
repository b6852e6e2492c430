//! Directory resolver
//!
//! Maps symbolic names to connection factories, queues and topics from a properties source such
//! as
//!
//! ```text
//! java.naming.factory.initial=org.apache.qpid.jms.jndi.JmsInitialContextFactory
//! connectionfactory.solaceConnectionLookup=amqp://localhost:5672?amqp.idleTimeout=120000
//! queue.queueLookup=Q/tutorial
//! topic.topicLookup=T/GettingStarted/pubsub
//! ```
//!
//! or from environment variables such as `JMS_QUEUE_queueLookup=Q/tutorial`.

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::Arc,
};

use config::{Config, Environment, Source};

use crate::{
    destination::{Queue, Topic},
    error::{Error, Result},
    factory::ConnectionFactory,
    transport::{amqp::AmqpBinding, loopback::LoopbackBroker, Binding},
};

/// Environment variable naming the properties file read by [`Resolver::from_default_file`]
pub const PROPERTIES_PATH_ENV: &str = "JMS_JNDI_PROPERTIES";

/// File read by [`Resolver::from_default_file`] when the environment variable is not set
pub const DEFAULT_PROPERTIES_FILE: &str = "jndi.properties";

const KEY_CONTEXT_FACTORY: &str = "initialContextFactory";
const KEY_CONTEXT_FACTORY_QUALIFIED: &str = "java.naming.factory.initial";
const PREFIX_CONNECTION_FACTORY: &str = "connectionfactory.";
const PREFIX_QUEUE: &str = "queue.";
const PREFIX_TOPIC: &str = "topic.";

/// The kind of a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    /// [`Endpoint::ConnectionFactory`]
    ConnectionFactory,
    /// [`Endpoint::Queue`]
    Queue,
    /// [`Endpoint::Topic`]
    Topic,
}

/// A typed directory entry
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// Factory configured from a `connectionfactory.<name>` entry
    ConnectionFactory(ConnectionFactory),
    /// Queue bound by a `queue.<name>` entry
    Queue(Queue),
    /// Topic bound by a `topic.<name>` entry
    Topic(Topic),
}

impl Endpoint {
    /// The kind of this entry
    pub fn kind(&self) -> EndpointKind {
        match self {
            Endpoint::ConnectionFactory(_) => EndpointKind::ConnectionFactory,
            Endpoint::Queue(_) => EndpointKind::Queue,
            Endpoint::Topic(_) => EndpointKind::Topic,
        }
    }
}

/// Which binding the `initialContextFactory` entry selects
#[derive(Debug, Clone)]
enum BindingChoice {
    Amqp,
    Loopback(LoopbackBroker),
}

impl BindingChoice {
    fn parse(identifier: &str) -> Result<Self> {
        match identifier {
            "amqp" | "fe2o3-amqp" | "org.apache.qpid.jms.jndi.JmsInitialContextFactory" => {
                Ok(Self::Amqp)
            }
            "loopback" => Ok(Self::Loopback(LoopbackBroker::new())),
            other => Err(Error::Config(format!(
                "{} does not name a known binding",
                other
            ))),
        }
    }

    fn binding(&self) -> Arc<dyn Binding> {
        match self {
            BindingChoice::Amqp => Arc::new(AmqpBinding::new()),
            BindingChoice::Loopback(broker) => Arc::new(broker.clone()),
        }
    }
}

/// Resolves symbolic names to typed endpoints
///
/// The whole source is read and validated when the resolver is created. [`Resolver::close`]
/// consumes the handle, so a closed resolver cannot be used.
#[derive(Debug)]
pub struct Resolver {
    entries: HashMap<String, Endpoint>,
    loopback: Option<LoopbackBroker>,
}

impl Resolver {
    /// Reads a properties file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("cannot read {}: {}", path.display(), err)))?;
        Self::from_properties_str(&text)
    }

    /// Reads the file named by `JMS_JNDI_PROPERTIES`, or `jndi.properties` in the working
    /// directory
    pub fn from_default_file() -> Result<Self> {
        match std::env::var_os(PROPERTIES_PATH_ENV) {
            Some(path) => Self::from_file(path),
            None => Self::from_file(DEFAULT_PROPERTIES_FILE),
        }
    }

    /// Reads `<PREFIX>_INITIALCONTEXTFACTORY`, `<PREFIX>_CONNECTIONFACTORY_<name>`,
    /// `<PREFIX>_QUEUE_<name>` and `<PREFIX>_TOPIC_<name>` variables
    ///
    /// Variable names are case insensitive, so names bound this way are looked up ignoring
    /// ASCII case.
    pub fn from_env(prefix: &str) -> Result<Self> {
        Self::from_environment(Environment::with_prefix(prefix).prefix_separator("_"))
    }

    fn from_environment(environment: Environment) -> Result<Self> {
        let variables = Config::builder()
            .add_source(environment)
            .build()
            .and_then(|config| config.collect())
            .map_err(|err| Error::Config(err.to_string()))?;

        let mut entries = Vec::new();
        for (key, value) in variables {
            let key = key.to_ascii_lowercase();
            let key = if key == KEY_CONTEXT_FACTORY.to_ascii_lowercase() {
                KEY_CONTEXT_FACTORY.to_string()
            } else if let Some(name) = key.strip_prefix("connectionfactory_") {
                format!("{}{}", PREFIX_CONNECTION_FACTORY, name)
            } else if let Some(name) = key.strip_prefix("queue_") {
                format!("{}{}", PREFIX_QUEUE, name)
            } else if let Some(name) = key.strip_prefix("topic_") {
                format!("{}{}", PREFIX_TOPIC, name)
            } else {
                continue;
            };
            let value = value
                .into_string()
                .map_err(|err| Error::Config(err.to_string()))?;
            entries.push((key, value));
        }
        Self::from_map(entries)
    }

    /// Parses properties text
    pub fn from_properties_str(text: &str) -> Result<Self> {
        Self::from_map(parse_properties(text)?)
    }

    /// Builds the resolver from key/value entries
    pub fn from_map<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Result<Self>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let entries: BTreeMap<String, String> = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let choice = match entries
            .get(KEY_CONTEXT_FACTORY)
            .or_else(|| entries.get(KEY_CONTEXT_FACTORY_QUALIFIED))
        {
            Some(identifier) => BindingChoice::parse(identifier.trim())?,
            None => BindingChoice::Amqp,
        };
        let binding = choice.binding();

        let mut resolved = HashMap::new();
        for (key, value) in &entries {
            let (name, endpoint) = if let Some(name) = key.strip_prefix(PREFIX_CONNECTION_FACTORY) {
                let factory = ConnectionFactory::builder()
                    .url(value.as_str())
                    .shared_binding(binding.clone())
                    .build()?;
                (name, Endpoint::ConnectionFactory(factory))
            } else if let Some(name) = key.strip_prefix(PREFIX_QUEUE) {
                (name, Endpoint::Queue(Queue::new(value.as_str())))
            } else if let Some(name) = key.strip_prefix(PREFIX_TOPIC) {
                (name, Endpoint::Topic(Topic::new(value.as_str())))
            } else {
                continue;
            };
            if resolved.insert(name.to_string(), endpoint).is_some() {
                return Err(Error::Config(format!("{} is bound more than once", name)));
            }
        }

        let loopback = match choice {
            BindingChoice::Loopback(broker) => {
                for endpoint in resolved.values() {
                    if let Endpoint::Queue(queue) = endpoint {
                        broker.provision_queue(queue.name());
                    }
                }
                Some(broker)
            }
            BindingChoice::Amqp => None,
        };

        Ok(Self {
            entries: resolved,
            loopback,
        })
    }

    /// Looks up any entry
    pub fn lookup(&self, name: &str) -> Result<Endpoint> {
        self.entries
            .get(name)
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case(name))
                    .map(|(_, endpoint)| endpoint)
            })
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Looks up a connection factory
    pub fn lookup_connection_factory(&self, name: &str) -> Result<ConnectionFactory> {
        match self.lookup(name)? {
            Endpoint::ConnectionFactory(factory) => Ok(factory),
            other => Err(mismatch(name, EndpointKind::ConnectionFactory, &other)),
        }
    }

    /// Looks up a queue
    pub fn lookup_queue(&self, name: &str) -> Result<Queue> {
        match self.lookup(name)? {
            Endpoint::Queue(queue) => Ok(queue),
            other => Err(mismatch(name, EndpointKind::Queue, &other)),
        }
    }

    /// Looks up a topic
    pub fn lookup_topic(&self, name: &str) -> Result<Topic> {
        match self.lookup(name)? {
            Endpoint::Topic(topic) => Ok(topic),
            other => Err(mismatch(name, EndpointKind::Topic, &other)),
        }
    }

    /// The in-process broker behind the factories when the source selects the `loopback`
    /// binding. Queues named in the source are provisioned on it.
    pub fn loopback_broker(&self) -> Option<&LoopbackBroker> {
        self.loopback.as_ref()
    }

    /// Releases the resolver
    pub fn close(self) {}
}

fn mismatch(name: &str, expected: EndpointKind, found: &Endpoint) -> Error {
    Error::TypeMismatch {
        name: name.to_string(),
        expected,
        found: found.kind(),
    }
}

/// Parses `key=value` / `key: value` lines, skipping blank lines and `#` or `!` comments
fn parse_properties(text: &str) -> Result<Vec<(String, String)>> {
    let mut entries = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let split = line
            .find(|c| c == '=' || c == ':')
            .ok_or_else(|| Error::Config(format!("line {}: expected key=value", number + 1)))?;
        let key = line[..split].trim();
        let value = line[split + 1..].trim();
        if key.is_empty() {
            return Err(Error::Config(format!("line {}: empty key", number + 1)));
        }
        entries.push((key.to_string(), value.to_string()));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROPERTIES: &str = "
# sample configuration
java.naming.factory.initial = org.apache.qpid.jms.jndi.JmsInitialContextFactory
connectionfactory.solaceConnectionLookup=amqp://localhost:5672?amqp.idleTimeout=120000
queue.queueLookup=Q/tutorial
! another comment style
topic.topicLookup: T/GettingStarted/pubsub
";

    #[test]
    fn resolves_typed_entries() {
        let resolver = Resolver::from_properties_str(PROPERTIES).unwrap();
        let factory = resolver
            .lookup_connection_factory("solaceConnectionLookup")
            .unwrap();
        assert_eq!(factory.url().as_str(), "amqp://localhost:5672");
        assert_eq!(resolver.lookup_queue("queueLookup").unwrap().name(), "Q/tutorial");
        assert_eq!(
            resolver.lookup_topic("topicLookup").unwrap().name(),
            "T/GettingStarted/pubsub"
        );
        assert!(resolver.loopback_broker().is_none());
        resolver.close();
    }

    #[test]
    fn missing_name_is_not_found() {
        let resolver = Resolver::from_properties_str(PROPERTIES).unwrap();
        match resolver.lookup("nope") {
            Err(Error::NotFound(name)) => assert_eq!(name, "nope"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn wrong_kind_is_type_mismatch() {
        let resolver = Resolver::from_properties_str(PROPERTIES).unwrap();
        match resolver.lookup_topic("queueLookup") {
            Err(Error::TypeMismatch { expected, found, .. }) => {
                assert_eq!(expected, EndpointKind::Topic);
                assert_eq!(found, EndpointKind::Queue);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_binding_is_rejected() {
        let result = Resolver::from_map([("initialContextFactory", "com.example.Unknown")]);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn loopback_provisions_queues() {
        let resolver = Resolver::from_map([
            ("initialContextFactory", "loopback"),
            ("queue.queueLookup", "Q/tutorial"),
        ])
        .unwrap();
        let broker = resolver.loopback_broker().unwrap();
        assert!(broker.has_queue("Q/tutorial"));
    }

    #[test]
    fn malformed_line_is_a_config_error() {
        let result = Resolver::from_properties_str("queue.queueLookup");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    fn environment(variables: &[(&str, &str)]) -> Environment {
        let source: config::Map<String, String> = variables
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Environment::with_prefix("JMS")
            .prefix_separator("_")
            .source(Some(source))
    }

    #[test]
    fn resolves_entries_from_environment() {
        let resolver = Resolver::from_environment(environment(&[
            ("JMS_INITIALCONTEXTFACTORY", "loopback"),
            ("JMS_CONNECTIONFACTORY_solaceConnectionLookup", "amqp://localhost:5672"),
            ("JMS_QUEUE_queueLookup", "Q/tutorial"),
            ("JMS_TOPIC_topic_lookup", "T/GettingStarted/pubsub"),
            ("OTHER_QUEUE_ignored", "Q/other"),
        ]))
        .unwrap();

        assert_eq!(resolver.lookup_queue("queueLookup").unwrap().name(), "Q/tutorial");
        assert_eq!(
            resolver.lookup_topic("topic_lookup").unwrap().name(),
            "T/GettingStarted/pubsub"
        );
        assert!(resolver
            .lookup_connection_factory("solaceConnectionLookup")
            .is_ok());
        assert!(matches!(resolver.lookup("ignored"), Err(Error::NotFound(_))));
        let broker = resolver.loopback_broker().unwrap();
        assert!(broker.has_queue("Q/tutorial"));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let result = Resolver::from_file("/definitely/not/here/jndi.properties");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}

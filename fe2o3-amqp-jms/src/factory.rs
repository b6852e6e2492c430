//! Connection factory

use std::{fmt, sync::Arc, time::Duration};

use url::Url;

use crate::{
    connection::Connection,
    error::{Error, Result},
    transport::{amqp::AmqpBinding, Binding, ConnectOptions},
};

/// Link credit granted to each consumer unless configured otherwise
pub const DEFAULT_PREFETCH: u32 = 1000;

const OPTION_IDLE_TIMEOUT: &str = "amqp.idleTimeout";
const OPTION_USERNAME: &str = "jms.username";
const OPTION_PASSWORD: &str = "jms.password";
const OPTION_CLIENT_ID: &str = "jms.clientID";
const OPTION_PREFETCH: &str = "jms.prefetchPolicy.all";

/// Immutable connection configuration that produces [`Connection`]s
///
/// The credentials stay inside the factory; the `Debug` output redacts the password.
#[derive(Clone)]
pub struct ConnectionFactory {
    url: Url,
    username: Option<String>,
    password: Option<String>,
    client_id: Option<String>,
    idle_timeout: Option<Duration>,
    prefetch: u32,
    binding: Arc<dyn Binding>,
}

impl fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("url", &self.url.as_str())
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("client_id", &self.client_id)
            .field("idle_timeout", &self.idle_timeout)
            .field("prefetch", &self.prefetch)
            .field("binding", &self.binding)
            .finish()
    }
}

impl ConnectionFactory {
    /// Creates a factory for a url such as `amqp://localhost:5672?amqp.idleTimeout=120000`
    /// using the AMQP binding
    pub fn new(url: impl AsRef<str>) -> Result<Self> {
        Self::builder().url(url.as_ref()).build()
    }

    /// Creates a builder
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Broker url, without options and user info
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// User name presented with SASL PLAIN
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Client id given to every connection, if fixed
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Idle timeout announced to the broker
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Link credit granted to each consumer
    pub fn prefetch(&self) -> u32 {
        self.prefetch
    }

    /// Same factory, connecting through another binding
    pub fn with_binding(mut self, binding: impl Binding + 'static) -> Self {
        self.binding = Arc::new(binding);
        self
    }

    /// Opens a connection with the stored credentials
    ///
    /// The connection starts in [`ConnectionState::Created`](crate::ConnectionState::Created);
    /// call [`Connection::start`] to receive messages.
    pub async fn create_connection(&self) -> Result<Connection> {
        self.connect(self.username.as_deref(), self.password.as_deref())
            .await
    }

    /// Opens a connection with the given credentials instead of the stored ones
    pub async fn create_connection_with(&self, username: &str, password: &str) -> Result<Connection> {
        self.connect(Some(username), Some(password)).await
    }

    async fn connect(&self, username: Option<&str>, password: Option<&str>) -> Result<Connection> {
        let container_id = match &self.client_id {
            Some(client_id) => client_id.clone(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        let options = ConnectOptions {
            url: &self.url,
            container_id: &container_id,
            username,
            password,
            idle_timeout: self.idle_timeout,
        };
        Connection::open(self.binding.as_ref(), options, self.prefetch).await
    }
}

/// Builder for [`ConnectionFactory`]
///
/// Values set on the builder take precedence over options found in the url.
#[derive(Debug, Default)]
pub struct Builder {
    url: Option<String>,
    username: Option<String>,
    password: Option<String>,
    client_id: Option<String>,
    idle_timeout: Option<Duration>,
    prefetch: Option<u32>,
    binding: Option<Arc<dyn Binding>>,
}

impl Builder {
    /// Creates an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker url, `amqp://host:port` or `amqps://host:port`, optionally with options
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// SASL PLAIN user name
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// SASL PLAIN password
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Fixed client id
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Idle timeout announced to the broker
    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = Some(idle_timeout);
        self
    }

    /// Link credit granted to each consumer
    pub fn prefetch(mut self, prefetch: u32) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    /// Binding used to reach the broker
    pub fn binding(mut self, binding: impl Binding + 'static) -> Self {
        self.binding = Some(Arc::new(binding));
        self
    }

    pub(crate) fn shared_binding(mut self, binding: Arc<dyn Binding>) -> Self {
        self.binding = Some(binding);
        self
    }

    /// Parses the url and its options
    pub fn build(self) -> Result<ConnectionFactory> {
        let raw = self
            .url
            .ok_or_else(|| Error::Config("connection factory has no url".to_string()))?;
        let mut url = Url::parse(&raw)?;
        match url.scheme() {
            "amqp" | "amqps" => {}
            scheme => {
                return Err(Error::Config(format!(
                    "unsupported scheme {:?}, expected amqp or amqps",
                    scheme
                )))
            }
        }

        let mut username = None;
        let mut password = None;
        let mut client_id = None;
        let mut idle_timeout = None;
        let mut prefetch = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                OPTION_USERNAME => username = Some(value.into_owned()),
                OPTION_PASSWORD => password = Some(value.into_owned()),
                OPTION_CLIENT_ID => client_id = Some(value.into_owned()),
                OPTION_IDLE_TIMEOUT => {
                    let millis = parse_number(&key, &value)?;
                    idle_timeout = Some(Duration::from_millis(millis));
                }
                OPTION_PREFETCH => {
                    let credit = u32::try_from(parse_number(&key, &value)?).map_err(|_| {
                        Error::Config(format!("{} must fit in 32 bits, got {}", key, value))
                    })?;
                    prefetch = Some(credit);
                }
                _ => {}
            }
        }

        if !url.username().is_empty() {
            username = username.or_else(|| Some(url.username().to_string()));
            password = password.or_else(|| url.password().map(str::to_string));
        }
        url.set_query(None);
        // Neither call fails for amqp urls, which always have a host
        let _ = url.set_username("");
        let _ = url.set_password(None);

        Ok(ConnectionFactory {
            url,
            username: self.username.or(username),
            password: self.password.or(password),
            client_id: self.client_id.or(client_id),
            idle_timeout: self.idle_timeout.or(idle_timeout),
            prefetch: self.prefetch.or(prefetch).unwrap_or(DEFAULT_PREFETCH),
            binding: self
                .binding
                .unwrap_or_else(|| Arc::new(AmqpBinding::new())),
        })
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{} must be a number, got {:?}", key, value)))
}

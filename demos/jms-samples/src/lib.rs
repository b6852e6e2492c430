//! Plumbing shared by the sample programs

use std::ffi::OsString;

use clap::{CommandFactory, FromArgMatches, Parser};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// `connectionfactory.<name>` entry in `jndi.properties`
pub const CONNECTION_LOOKUP: &str = "solaceConnectionLookup";

/// `queue.<name>` entry in `jndi.properties`
pub const QUEUE_LOOKUP: &str = "queueLookup";

/// `topic.<name>` entry in `jndi.properties`
pub const TOPIC_LOOKUP: &str = "topicLookup";

pub const QUEUE_NAME: &str = "Q/tutorial";

pub const TOPIC_NAME: &str = "T/GettingStarted/pubsub";

/// Arguments of the samples that are pointed at a broker on the command line
#[derive(Debug, Parser)]
pub struct HostArgs {
    /// Broker url such as amqp://localhost:5672. The scheme may be left out.
    #[arg(value_name = "host-url")]
    pub host: String,

    /// Username for SASL PLAIN
    pub username: Option<String>,

    /// Password for SASL PLAIN
    #[arg(requires = "username")]
    pub password: Option<String>,
}

impl HostArgs {
    /// Parses the process arguments, printing the usage banner and exiting on error
    pub fn parse_for(program: &'static str) -> Self {
        Self::try_parse_for(program, std::env::args_os()).unwrap_or_else(|err| err.exit())
    }

    pub fn try_parse_for<I, T>(program: &'static str, args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let mut command = Self::command().name(program).override_usage(format!(
            "{} amqp://<msg_backbone_ip:amqp_port> [username password]",
            program
        ));
        let matches = command.try_get_matches_from_mut(args)?;
        Self::from_arg_matches(&matches)
    }

    /// The host argument with an `amqp://` scheme added when it has none
    pub fn url(&self) -> String {
        if self.host.contains("://") {
            self.host.clone()
        } else {
            format!("amqp://{}", self.host)
        }
    }
}

pub fn init_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();

    // A second call in the same process keeps the first subscriber
    let _ = tracing::subscriber::set_global_default(subscriber);
}

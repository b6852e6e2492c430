#![allow(dead_code)]

use std::time::Duration;

use fe2o3_amqp_jms::{ConnectionFactory, LoopbackBroker};
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};
use tokio::sync::OnceCell;

pub const URL: &str = "amqp://localhost:5672";

pub const WAIT: Duration = Duration::from_secs(5);

pub const SHORT: Duration = Duration::from_millis(100);

/// An in-process broker with the given queues provisioned, and a factory connecting to it
pub fn loopback(queues: &[&str]) -> (LoopbackBroker, ConnectionFactory) {
    let broker = LoopbackBroker::new();
    for queue in queues {
        broker.provision_queue(*queue);
    }
    let factory = ConnectionFactory::builder()
        .url(URL)
        .binding(broker.clone())
        .build()
        .unwrap();
    (broker, factory)
}

static DOCKER: OnceCell<Cli> = OnceCell::const_new();

pub async fn setup_activemq_artemis() -> (Container<'static, GenericImage>, u16) {
    let docker = DOCKER.get_or_init(|| async { Cli::default() }).await;
    let image = GenericImage::new("docker.io/vromero/activemq-artemis", "latest")
        .with_env_var("DISABLE_SECURITY", "true")
        .with_exposed_port(5672)
        .with_wait_for(WaitFor::seconds(5));
    let node = docker.run(image);
    let port = node.get_host_port_ipv4(5672);
    (node, port)
}

//! Serial delivery of messages to listeners
//!
//! Every session runs one dispatcher task. Consumers switched to asynchronous mode hand their
//! inbox to it, so at most one listener of the session is running at any time, and commands
//! (register, unregister, barrier) are only observed between two listener invocations.

use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;

use crate::{
    consumer::{ConsumerShared, MessageListener},
    transport::Inbound,
};

pub(crate) enum DispatchCommand {
    /// Installs or replaces the listener of a consumer. The inbox is only handed over the first
    /// time.
    Register {
        consumer: Arc<ConsumerShared>,
        inbox: Option<mpsc::UnboundedReceiver<Inbound>>,
        listener: Arc<dyn MessageListener>,
    },
    /// Stops dispatching to a consumer, acknowledged once no listener of it is running.
    /// With `detach` the dispatcher also detaches the consumer's link.
    Unregister {
        consumer: u64,
        done: Option<oneshot::Sender<()>>,
        detach: bool,
    },
    /// Acknowledged once the listener running at the time of the request has returned
    Barrier(oneshot::Sender<()>),
}

struct Registration {
    consumer: Arc<ConsumerShared>,
    listener: Arc<dyn MessageListener>,
}

pub(crate) async fn dispatch_loop(
    mut commands: mpsc::UnboundedReceiver<DispatchCommand>,
    mut started: watch::Receiver<bool>,
    cancel: CancellationToken,
) {
    let mut inboxes: StreamMap<u64, UnboundedReceiverStream<Inbound>> = StreamMap::new();
    let mut registrations: HashMap<u64, Registration> = HashMap::new();

    loop {
        let running = *started.borrow_and_update();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(DispatchCommand::Register { consumer, inbox, listener }) => {
                    let id = consumer.id;
                    if let Some(inbox) = inbox {
                        inboxes.insert(id, UnboundedReceiverStream::new(inbox));
                    }
                    registrations.insert(id, Registration { consumer, listener });
                }
                Some(DispatchCommand::Unregister { consumer, done, detach }) => {
                    inboxes.remove(&consumer);
                    if let Some(registration) = registrations.remove(&consumer) {
                        if detach {
                            registration.consumer.detach(None);
                        }
                    }
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                }
                Some(DispatchCommand::Barrier(done)) => {
                    let _ = done.send(());
                }
                None => break,
            },
            changed = started.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            Some((id, inbound)) = inboxes.next(), if running => {
                if let Some(registration) = registrations.get(&id) {
                    deliver(registration, inbound);
                }
            }
        }
    }
}

fn deliver(registration: &Registration, inbound: Inbound) {
    let consumer = &registration.consumer;
    if consumer.is_closed() {
        return;
    }
    let Some((message, delivered)) = consumer.admit(inbound) else {
        return;
    };

    let listener = registration.listener.clone();
    match catch_unwind(AssertUnwindSafe(move || listener.on_message(message))) {
        Ok(()) => consumer.complete(delivered),
        Err(_) => {
            #[cfg(feature = "tracing")]
            tracing::error!(
                destination = %consumer.destination(),
                "message listener panicked, releasing the delivery"
            );
            #[cfg(feature = "log")]
            log::error!(
                "message listener on {} panicked, releasing the delivery",
                consumer.destination()
            );
            consumer.abandon(delivered);
        }
    }
}

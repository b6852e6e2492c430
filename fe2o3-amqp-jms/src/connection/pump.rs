//! Failure pump
//!
//! One task per connection waits for the first terminal transport error, whether it is reported by
//! the binding itself or by a link task that saw its connection go away, and tears the connection
//! down.

use std::{pin::Pin, sync::Weak};

use tokio::sync::mpsc;
use tokio_stream::{wrappers::UnboundedReceiverStream, Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use super::ConnectionInner;
use crate::transport::TransportError;

pub(crate) async fn failure_pump(
    connection: Weak<ConnectionInner>,
    internal: mpsc::UnboundedReceiver<TransportError>,
    external: Option<mpsc::UnboundedReceiver<TransportError>>,
    cancel: CancellationToken,
) {
    let mut failures: Pin<Box<dyn Stream<Item = TransportError> + Send>> = match external {
        Some(external) => Box::pin(
            UnboundedReceiverStream::new(internal).merge(UnboundedReceiverStream::new(external)),
        ),
        None => Box::pin(UnboundedReceiverStream::new(internal)),
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {}
        failure = failures.next() => {
            if let (Some(failure), Some(connection)) = (failure, connection.upgrade()) {
                connection.fail(failure);
            }
        }
    }
}

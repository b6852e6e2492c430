//! Acknowledgement bookkeeping for client acknowledge sessions

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
    error::{Error, Result},
    transport::{DeliveryTag, Disposition},
};

/// Command sent to the task that owns a receiving link
#[derive(Debug)]
pub(crate) enum LinkCommand {
    Settle(DeliveryTag, Disposition),
    Close(Option<tokio::sync::oneshot::Sender<()>>),
}

#[derive(Debug)]
struct Pending {
    consumer: u64,
    tag: DeliveryTag,
    link: mpsc::UnboundedSender<LinkCommand>,
}

impl Pending {
    fn settle(self, disposition: Disposition) {
        // The link task is gone once its consumer is closed. The broker already took the
        // delivery back in that case.
        let _ = self.link.send(LinkCommand::Settle(self.tag, disposition));
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    closed: bool,
    next_seq: u64,
    pending: BTreeMap<u64, Pending>,
}

/// Unsettled deliveries of one session in delivery order
#[derive(Debug, Default)]
pub(crate) struct AckTracker {
    state: Mutex<TrackerState>,
}

impl AckTracker {
    /// Records a delivery handed to the application and returns its position
    pub fn track(&self, consumer: u64, tag: DeliveryTag, link: mpsc::UnboundedSender<LinkCommand>) -> u64 {
        let mut state = self.state.lock();
        state.next_seq += 1;
        let seq = state.next_seq;
        state.pending.insert(seq, Pending { consumer, tag, link });
        seq
    }

    /// Accepts every delivery up to and including `seq`
    pub fn acknowledge_through(&self, seq: u64) -> Result<()> {
        let acknowledged = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::SessionClosed);
            }
            let rest = state.pending.split_off(&(seq + 1));
            std::mem::replace(&mut state.pending, rest)
        };
        for pending in acknowledged.into_values() {
            pending.settle(Disposition::Accepted);
        }
        Ok(())
    }

    /// Gives a single delivery back to the broker
    pub fn release(&self, seq: u64) {
        let pending = self.state.lock().pending.remove(&seq);
        if let Some(pending) = pending {
            pending.settle(Disposition::Released);
        }
    }

    /// Gives every unacknowledged delivery back to the broker
    pub fn release_all(&self) {
        let pending = std::mem::take(&mut self.state.lock().pending);
        for pending in pending.into_values() {
            pending.settle(Disposition::Released);
        }
    }

    /// Drops the deliveries of a closed consumer; closing its link returned them already
    pub fn forget_consumer(&self, consumer: u64) {
        self.state
            .lock()
            .pending
            .retain(|_, pending| pending.consumer != consumer);
    }

    pub fn close(&self) {
        self.release_all();
        self.state.lock().closed = true;
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }
}

/// Handle stored in a received message that acknowledges it through its session
#[derive(Debug, Clone)]
pub(crate) struct AckHandle {
    tracker: Arc<AckTracker>,
    seq: u64,
}

impl AckHandle {
    pub fn new(tracker: Arc<AckTracker>, seq: u64) -> Self {
        Self { tracker, seq }
    }

    pub fn acknowledge(&self) -> Result<()> {
        self.tracker.acknowledge_through(self.seq)
    }
}

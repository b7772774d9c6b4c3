//! Cross-task event delivery.
//!
//! A machine lives on one tokio task. Everything else (network tasks,
//! timers, user handles) reaches it through a cloneable [`Poster`]; the
//! owning task feeds the [`Mailbox`] into the machine's FIFO queue, so
//! posts from many tasks are serialized without a lock on the machine.

use crate::fsm::{Event, FsmResult, StateMachine};
use tokio::sync::mpsc;
use tracing::trace;

struct Envelope {
    event: Event,
    coalesce: bool,
}

/// Sending half: posts events to a machine from any task.
#[derive(Clone)]
pub struct Poster {
    machine: &'static str,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl std::fmt::Debug for Poster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poster")
            .field("machine", &self.machine)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl Poster {
    /// Posts an event. Returns false if the machine is gone.
    pub fn post(&self, event: Event) -> bool {
        self.send(event, false)
    }

    /// Posts an event unless one with the same code is already queued when
    /// the machine picks it up.
    pub fn post_at_most_one(&self, event: Event) -> bool {
        self.send(event, true)
    }

    /// Returns true once the receiving task has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, event: Event, coalesce: bool) -> bool {
        let mnemonic = event.mnemonic;
        let sent = self.tx.send(Envelope { event, coalesce }).is_ok();
        if !sent {
            trace!(machine = self.machine, mnemonic, "post to finished machine ignored");
        }
        sent
    }
}

/// Receiving half, owned by the machine's task.
pub struct Mailbox {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

/// Creates a connected poster/mailbox pair.
pub fn mailbox(machine: &'static str) -> (Poster, Mailbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Poster { machine, tx }, Mailbox { rx })
}

impl Mailbox {
    /// Feeds events to `machine` until it stops or every poster is dropped.
    ///
    /// Events that are ready together are queued before draining, so
    /// coalescing sees all of them.
    pub async fn drive<C>(&mut self, machine: &mut StateMachine<C>) -> FsmResult<()> {
        while !machine.is_stopped() {
            let Some(first) = self.rx.recv().await else {
                break;
            };
            Self::deliver(machine, first);
            while let Ok(next) = self.rx.try_recv() {
                Self::deliver(machine, next);
            }
            machine.drain()?;
        }
        Ok(())
    }

    /// Delivers whatever is ready right now without waiting. Returns the
    /// number of envelopes delivered.
    pub fn pump<C>(&mut self, machine: &mut StateMachine<C>) -> FsmResult<usize> {
        let mut delivered = 0;
        while let Ok(next) = self.rx.try_recv() {
            Self::deliver(machine, next);
            delivered += 1;
        }
        machine.drain()?;
        Ok(delivered)
    }

    fn deliver<C>(machine: &mut StateMachine<C>, envelope: Envelope) {
        if envelope.coalesce {
            machine.enqueue_at_most_one(envelope.event);
        } else {
            machine.enqueue(envelope.event);
        }
    }
}

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::command::{WorkerCommand, WorkerEvent};
use crate::error::{ControllerError, Result};
use crate::model::WorkerId;
use crate::workers::WorkerRegistry;

/// An inbound event tagged with its originating worker.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub worker: WorkerId,
    pub event: WorkerEvent,
}

/// Loop-local staging queue: control-plane events (handshakes, completions,
/// termination) are applied before spawn and define traffic. Within a band,
/// per-worker arrival order is preserved because each connection feeds the
/// channel in send order.
#[derive(Default)]
pub struct InboundQueue {
    control: VecDeque<Envelope>,
    normal: VecDeque<Envelope>,
}

impl InboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, envelope: Envelope) {
        if envelope.event.is_control() {
            self.control.push_back(envelope);
        } else {
            self.normal.push_back(envelope);
        }
    }

    pub fn pop(&mut self) -> Option<Envelope> {
        self.control.pop_front().or_else(|| self.normal.pop_front())
    }

    pub fn len(&self) -> usize {
        self.control.len() + self.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.control.is_empty() && self.normal.is_empty()
    }
}

/// Cloneable entry point handed to worker connections.
#[derive(Clone)]
pub struct ControllerHandle {
    evt_tx: mpsc::Sender<Envelope>,
    registry: Arc<WorkerRegistry>,
    command_queue_capacity: usize,
}

impl ControllerHandle {
    pub(crate) fn new(
        evt_tx: mpsc::Sender<Envelope>,
        registry: Arc<WorkerRegistry>,
        command_queue_capacity: usize,
    ) -> Self {
        Self {
            evt_tx,
            registry,
            command_queue_capacity,
        }
    }

    /// Joins a worker connection: registers its outbound channel, enqueues
    /// the handshake, and returns the assigned id with the command stream.
    pub async fn connect_worker(
        &self,
        requested: Option<WorkerId>,
    ) -> Result<(WorkerId, mpsc::Receiver<WorkerCommand>)> {
        let (tx, rx) = mpsc::channel(self.command_queue_capacity);
        let id = self.registry.register(requested, tx);
        self.submit(id, WorkerEvent::Handshake { worker: Some(id) })
            .await?;
        Ok((id, rx))
    }

    /// Submits one event on behalf of a worker.
    pub async fn submit(&self, worker: WorkerId, event: WorkerEvent) -> Result<()> {
        self.evt_tx
            .send(Envelope { worker, event })
            .await
            .map_err(|_| ControllerError::ChannelClosed(worker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(worker: WorkerId, event: WorkerEvent) -> Envelope {
        Envelope { worker, event }
    }

    #[test]
    fn test_control_band_drains_first() {
        let mut queue = InboundQueue::new();
        queue.push(envelope(
            1,
            WorkerEvent::DetectTemplate {
                name: "iter".to_string(),
            },
        ));
        queue.push(envelope(1, WorkerEvent::Handshake { worker: None }));

        assert!(matches!(
            queue.pop().unwrap().event,
            WorkerEvent::Handshake { .. }
        ));
        assert!(matches!(
            queue.pop().unwrap().event,
            WorkerEvent::DetectTemplate { .. }
        ));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_per_worker_order_within_band() {
        let mut queue = InboundQueue::new();
        queue.push(envelope(
            1,
            WorkerEvent::DetectTemplate {
                name: "a".to_string(),
            },
        ));
        queue.push(envelope(
            1,
            WorkerEvent::DetectTemplate {
                name: "b".to_string(),
            },
        ));

        let first = queue.pop().unwrap();
        let second = queue.pop().unwrap();
        match (first.event, second.event) {
            (
                WorkerEvent::DetectTemplate { name: a },
                WorkerEvent::DetectTemplate { name: b },
            ) => {
                assert_eq!(a, "a");
                assert_eq!(b, "b");
            }
            other => panic!("unexpected order: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_worker_enqueues_handshake() {
        let (evt_tx, mut evt_rx) = mpsc::channel(8);
        let registry = Arc::new(WorkerRegistry::new());
        let handle = ControllerHandle::new(evt_tx, registry.clone(), 8);

        let (id, _cmd_rx) = handle.connect_worker(None).await.unwrap();
        assert!(registry.contains(id));

        let envelope = evt_rx.recv().await.unwrap();
        assert_eq!(envelope.worker, id);
        assert!(matches!(
            envelope.event,
            WorkerEvent::Handshake { worker: Some(w) } if w == id
        ));
    }
}

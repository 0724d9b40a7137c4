use std::collections::VecDeque;

use crate::{error::TaskFailure, messaging::PendingRequest, TaskId};

/// Bounded FIFO of requests waiting for the worker.
///
/// Requests wait here while a task is in flight and while no generation is ready.
/// They leave strictly in arrival order.
#[derive(Debug)]
pub(crate) struct RequestRouter {
    queue: VecDeque<PendingRequest>,
    capacity: usize,
    next_task_id: TaskId,
}

impl RequestRouter {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            next_task_id: 1,
        }
    }

    /// Queues `request`, or hands it back when the queue is full.
    pub(crate) fn admit(&mut self, request: PendingRequest) -> Result<(), PendingRequest> {
        if self.queue.len() >= self.capacity {
            return Err(request);
        }
        self.queue.push_back(request);
        Ok(())
    }

    /// Next request whose caller is still waiting.
    pub(crate) fn next(&mut self) -> Option<PendingRequest> {
        while let Some(request) = self.queue.pop_front() {
            if request.reply.is_closed() {
                tracing::debug!("skipping request abandoned by its caller");
                continue;
            }
            return Some(request);
        }
        None
    }

    pub(crate) fn assign_task_id(&mut self) -> TaskId {
        let id = self.next_task_id;
        self.next_task_id += 1;
        id
    }

    pub(crate) fn fail_all(&mut self, failure: &TaskFailure) {
        for request in self.queue.drain(..) {
            let _ = request.reply.send(Err(failure.clone()));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::TaskOutcome;
    use tokio::{sync::oneshot, time::Instant};

    fn request(payload: &str) -> (PendingRequest, oneshot::Receiver<TaskOutcome>) {
        let (reply, rx) = oneshot::channel();
        (
            PendingRequest {
                payload: payload.as_bytes().to_vec(),
                reply,
                received_at: Instant::now(),
            },
            rx,
        )
    }

    #[test]
    fn test_fifo_order() {
        let mut router = RequestRouter::new(4);
        let mut receivers = Vec::new();
        for name in ["a", "b", "c"] {
            let (req, rx) = request(name);
            router.admit(req).unwrap();
            receivers.push(rx);
        }
        let order: Vec<Vec<u8>> = std::iter::from_fn(|| router.next())
            .map(|r| r.payload)
            .collect();
        assert_eq!(order, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_rejects_when_full() {
        let mut router = RequestRouter::new(1);
        let (first, _rx1) = request("first");
        let (second, _rx2) = request("second");
        router.admit(first).unwrap();
        let rejected = router.admit(second).unwrap_err();
        assert_eq!(rejected.payload, b"second".to_vec());
        assert_eq!(router.len(), 1);
    }

    #[test]
    fn test_skips_abandoned_requests() {
        let mut router = RequestRouter::new(4);
        let (gone, rx) = request("gone");
        let (kept, _rx) = request("kept");
        router.admit(gone).unwrap();
        router.admit(kept).unwrap();
        drop(rx);
        assert_eq!(router.next().unwrap().payload, b"kept".to_vec());
        assert!(router.next().is_none());
    }

    #[test]
    fn test_fail_all_resolves_everyone() {
        let mut router = RequestRouter::new(4);
        let (a, mut rx_a) = request("a");
        let (b, mut rx_b) = request("b");
        router.admit(a).unwrap();
        router.admit(b).unwrap();
        router.fail_all(&TaskFailure::ShuttingDown);
        assert_eq!(rx_a.try_recv().unwrap(), Err(TaskFailure::ShuttingDown));
        assert_eq!(rx_b.try_recv().unwrap(), Err(TaskFailure::ShuttingDown));
        assert_eq!(router.len(), 0);
    }

    #[test]
    fn test_task_ids_increase() {
        let mut router = RequestRouter::new(1);
        assert_eq!(router.assign_task_id(), 1);
        assert_eq!(router.assign_task_id(), 2);
    }
}

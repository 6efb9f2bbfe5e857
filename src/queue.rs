//! FIFO hand-off between submitters and workers.

use std::mem;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crossbeam::channel::{self, select, Receiver, Sender};

use crate::{PoolError, Result};

/// The channel connecting submitters to workers.
///
/// The controller holds the only long-lived sender. Submitters clone it for
/// the duration of a push, so closing the queue never cuts off a push that is
/// already under way; the channel disconnects once the last of them returns.
///
/// A zero-capacity queue also counts ready consumers. Every consumer sends a
/// token before it blocks on the channel, and a push must take a token before
/// sending, so a push only waits on its timeout when no consumer is ready.
pub struct DispatchQueue<T> {
    tx: Mutex<Option<Sender<T>>>,
    rx: Receiver<T>,
    capacity: Option<usize>,
    ready: Option<Ready>,
    abort_tx: Mutex<Option<Sender<()>>>,
    abort_rx: Receiver<()>,
}

/// Ready tokens of a rendezvous queue.
struct Ready {
    tx: Sender<()>,
    rx: Receiver<()>,
}

/// The consuming end of a [`DispatchQueue`], held by workers.
pub struct QueueReceiver<T> {
    rx: Receiver<T>,
    ready: Option<Sender<()>>,
    announced: bool,
}

impl<T> Clone for QueueReceiver<T> {
    fn clone(&self) -> Self {
        QueueReceiver {
            rx: self.rx.clone(),
            ready: self.ready.clone(),
            announced: false,
        }
    }
}

impl<T> DispatchQueue<T> {
    /// Creates a queue. `None` is unbounded, `Some(0)` a rendezvous channel.
    pub fn new(capacity: Option<usize>) -> Self {
        let (tx, rx) = match capacity {
            Some(cap) => channel::bounded(cap),
            None => channel::unbounded(),
        };
        let ready = match capacity {
            Some(0) => {
                let (tx, rx) = channel::unbounded();
                Some(Ready { tx, rx })
            }
            _ => None,
        };
        let (abort_tx, abort_rx) = channel::bounded(0);
        DispatchQueue {
            tx: Mutex::new(Some(tx)),
            rx,
            capacity,
            ready,
            abort_tx: Mutex::new(Some(abort_tx)),
            abort_rx,
        }
    }

    /// Enqueues a task, blocking while the queue is full or, for a rendezvous
    /// queue, while no consumer is ready.
    ///
    /// With a timeout, returns `PoolError::Timeout` if no room was made in
    /// time; the task is dropped, not enqueued. Returns `PoolError::Closed`
    /// once the queue is closed or aborted.
    pub fn push(&self, task: T, timeout: Option<Duration>) -> Result<()> {
        let tx = self.sender()?;
        if self.ready.is_some() {
            self.claim(timeout)?;
            // The claimed consumer is already on its way to the channel.
            return self.send(tx, task, None);
        }
        self.send(tx, task, timeout)
    }

    /// Takes one ready token, waiting at most `timeout`.
    fn claim(&self, timeout: Option<Duration>) -> Result<()> {
        let ready = match &self.ready {
            Some(ready) => ready,
            None => return Ok(()),
        };
        if let Ok(()) = ready.rx.try_recv() {
            return Ok(());
        }
        match timeout {
            None => select! {
                recv(ready.rx) -> _ => Ok(()),
                recv(self.abort_rx) -> _ => Err(PoolError::Closed),
            },
            Some(timeout) => select! {
                recv(ready.rx) -> _ => Ok(()),
                recv(self.abort_rx) -> _ => Err(PoolError::Closed),
                default(timeout) => Err(PoolError::Timeout),
            },
        }
    }

    fn send(&self, tx: Sender<T>, task: T, timeout: Option<Duration>) -> Result<()> {
        match timeout {
            None => select! {
                send(tx, task) -> res => res.map_err(|_| PoolError::Closed),
                recv(self.abort_rx) -> _ => Err(PoolError::Closed),
            },
            Some(timeout) => select! {
                send(tx, task) -> res => res.map_err(|_| PoolError::Closed),
                recv(self.abort_rx) -> _ => Err(PoolError::Closed),
                default(timeout) => Err(PoolError::Timeout),
            },
        }
    }

    /// Stops accepting new pushes.
    pub fn close(&self) {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Fails every push still blocked, and every later one, with
    /// `PoolError::Closed`.
    pub fn abort(&self) {
        self.abort_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Removes every task still queued without running it.
    pub fn drain(&self) -> usize {
        self.rx.try_iter().count()
    }

    /// Returns the consuming end for a worker.
    pub fn receiver(&self) -> QueueReceiver<T> {
        QueueReceiver {
            rx: self.rx.clone(),
            ready: self.ready.as_ref().map(|ready| ready.tx.clone()),
            announced: false,
        }
    }

    /// Returns a consuming end whose first ready token the caller sends
    /// through [`DispatchQueue::announce`].
    pub(crate) fn announced_receiver(&self) -> QueueReceiver<T> {
        QueueReceiver {
            announced: true,
            ..self.receiver()
        }
    }

    /// Counts one more consumer as ready.
    pub(crate) fn announce(&self) {
        if let Some(ready) = &self.ready {
            let _ = ready.tx.send(());
        }
    }

    /// Number of tasks waiting to be picked up.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether no task is waiting.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// The configured capacity.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    fn sender(&self) -> Result<Sender<T>> {
        if self
            .abort_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
        {
            return Err(PoolError::Closed);
        }
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .cloned()
            .ok_or(PoolError::Closed)
    }
}

impl<T> QueueReceiver<T> {
    /// Blocks for the next task. Returns `None` once the queue is closed and
    /// drained.
    pub fn pop(&mut self) -> Option<T> {
        if !mem::take(&mut self.announced) {
            if let Some(ready) = &self.ready {
                // Only fails once the queue is gone.
                let _ = ready.send(());
            }
        }
        self.rx.recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn pop_returns_none_only_after_close_and_drain() {
        let queue = DispatchQueue::new(None);
        let mut rx = queue.receiver();
        queue.push(1, None).unwrap();
        queue.push(2, None).unwrap();
        queue.close();

        assert_eq!(rx.pop(), Some(1));
        assert_eq!(rx.pop(), Some(2));
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn push_after_close_is_rejected() {
        let queue = DispatchQueue::new(Some(4));
        queue.close();
        assert!(matches!(queue.push(1, None), Err(PoolError::Closed)));
    }

    #[test]
    fn zero_capacity_push_times_out_without_consumer() {
        let queue = DispatchQueue::new(Some(0));
        let err = queue.push(7, Some(Duration::from_millis(0))).unwrap_err();
        assert!(matches!(err, PoolError::Timeout));
        assert!(queue.is_empty());
    }

    #[test]
    fn zero_capacity_hands_off_to_waiting_consumer() {
        let queue = DispatchQueue::new(Some(0));
        let mut rx = queue.receiver();
        let consumer = thread::spawn(move || rx.pop());

        queue.push(42, None).unwrap();
        assert_eq!(consumer.join().unwrap(), Some(42));
    }

    #[test]
    fn full_bounded_queue_times_out() {
        let queue = DispatchQueue::new(Some(1));
        queue.push(1, Some(Duration::from_millis(0))).unwrap();
        let err = queue.push(2, Some(Duration::from_millis(10))).unwrap_err();
        assert!(matches!(err, PoolError::Timeout));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn drain_rejects_leftovers() {
        let queue = DispatchQueue::new(None);
        for i in 0..5 {
            queue.push(i, None).unwrap();
        }
        queue.close();
        assert_eq!(queue.drain(), 5);
        assert_eq!(queue.receiver().pop(), None);
    }

    #[test]
    fn announced_consumer_takes_zero_timeout_push() {
        let queue = DispatchQueue::new(Some(0));
        let mut rx = queue.announced_receiver();
        queue.announce();

        // The consumer has not reached the channel yet, but is counted ready.
        queue.push(5, Some(Duration::from_millis(0))).unwrap();
        assert_eq!(rx.pop(), Some(5));
    }

    #[test]
    fn abort_releases_blocked_push() {
        let queue = Arc::new(DispatchQueue::new(Some(1)));
        queue.push(1, None).unwrap();

        let blocked = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(2, None))
        };
        thread::sleep(Duration::from_millis(20));
        queue.abort();

        assert!(matches!(blocked.join().unwrap(), Err(PoolError::Closed)));
        assert_eq!(queue.len(), 1);
        assert!(matches!(queue.push(3, None), Err(PoolError::Closed)));
    }

    #[test]
    fn abort_releases_rendezvous_push_without_consumer() {
        let queue = Arc::new(DispatchQueue::new(Some(0)));
        let blocked = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(1, None))
        };
        thread::sleep(Duration::from_millis(20));
        queue.abort();

        assert!(matches!(blocked.join().unwrap(), Err(PoolError::Closed)));
    }
}

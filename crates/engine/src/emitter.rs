//! Result delivery
//!
//! Results flow from dispatcher threads to the consumer in completion order.
//! The engine never buffers to restore input order; a consumer that needs it
//! wraps the drain in a [`Resequencer`].

use std::collections::BTreeMap;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::record::TaskResult;

/// Create a connected emitter and drain
pub fn channel<V>() -> (ResultEmitter<V>, Drain<V>) {
    let (tx, rx) = unbounded();
    (ResultEmitter { tx }, Drain { rx })
}

/// Sending half, held by the scheduler's dispatchers
///
/// The drain ends once every emitter clone has been dropped.
#[derive(Debug)]
pub struct ResultEmitter<V> {
    tx: Sender<TaskResult<V>>,
}

impl<V> Clone for ResultEmitter<V> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<V> ResultEmitter<V> {
    /// Deliver one finished task's result
    ///
    /// Returns false if the consumer has gone away; the result is dropped.
    pub fn on_task_finished(&self, result: TaskResult<V>) -> bool {
        self.tx.send(result).is_ok()
    }

    /// Results delivered but not yet drained
    pub fn pending(&self) -> usize {
        self.tx.len()
    }
}

/// No result arrived within [`Drain::next_timeout`]'s wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no result within {waited:?}")]
pub struct DrainTimeout {
    pub waited: Duration,
}

/// Receiving half: a finite, lazy sequence of results in completion order
#[derive(Debug)]
pub struct Drain<V> {
    rx: Receiver<TaskResult<V>>,
}

impl<V> Drain<V> {
    /// Take a result if one is ready, without waiting
    pub fn try_next(&self) -> Option<TaskResult<V>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Wait up to `timeout` for the next result
    ///
    /// Returns `Ok(None)` when the sequence is exhausted.
    pub fn next_timeout(&self, timeout: Duration) -> Result<Option<TaskResult<V>>, DrainTimeout> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Ok(Some(result)),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
            Err(RecvTimeoutError::Timeout) => Err(DrainTimeout { waited: timeout }),
        }
    }

    /// Results waiting to be drained
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Check if no result is waiting right now
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Re-sequence into input order
    pub fn ordered(self) -> Ordered<V> {
        Ordered {
            drain: self,
            resequencer: Resequencer::new(),
        }
    }
}

impl<V> Iterator for Drain<V> {
    type Item = TaskResult<V>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

/// Restores input order from results that arrive out of order
///
/// Holds only the results that arrived ahead of a slower, earlier record.
#[derive(Debug)]
pub struct Resequencer<V> {
    next_index: usize,
    pending: BTreeMap<usize, TaskResult<V>>,
}

impl<V> Default for Resequencer<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Resequencer<V> {
    /// Start expecting index 0
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Start expecting `index`
    pub fn starting_at(index: usize) -> Self {
        Self {
            next_index: index,
            pending: BTreeMap::new(),
        }
    }

    /// Accept a result in any order
    pub fn push(&mut self, result: TaskResult<V>) {
        self.pending.insert(result.index, result);
    }

    /// Take the next result in input order, if it has arrived
    pub fn pop_ready(&mut self) -> Option<TaskResult<V>> {
        let result = self.pending.remove(&self.next_index)?;
        self.next_index += 1;
        Some(result)
    }

    /// Take the lowest buffered result, skipping any gap before it
    ///
    /// Used once the input is exhausted and no missing index can still arrive.
    pub fn pop_lowest(&mut self) -> Option<TaskResult<V>> {
        let (index, result) = self.pending.pop_first()?;
        self.next_index = index + 1;
        Some(result)
    }

    /// Index the next in-order result must carry
    pub fn next_index(&self) -> usize {
        self.next_index
    }

    /// Results buffered while waiting for an earlier index
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

/// Iterator yielding drained results in input order
#[derive(Debug)]
pub struct Ordered<V> {
    drain: Drain<V>,
    resequencer: Resequencer<V>,
}

impl<V> Iterator for Ordered<V> {
    type Item = TaskResult<V>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(result) = self.resequencer.pop_ready() {
                return Some(result);
            }
            match self.drain.next() {
                Some(result) => self.resequencer.push(result),
                None => return self.resequencer.pop_lowest(),
            }
        }
    }
}

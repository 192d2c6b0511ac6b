//! Reordering between the worker pool and the single consumer.
//!
//! Workers complete in any order; [`OrderedResults`] hands results to its
//! consumer strictly by ascending unit index, each exactly once.

use std::collections::BTreeMap;

use futures::Stream;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use crate::error::SynthesisFailure;
use crate::worker::{stop_requested, Outcome, SynthesisResult};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("unit {0} was already delivered")]
    Stale(usize),

    #[error("unit {0} is already buffered")]
    Duplicate(usize),
}

/// Buffers items keyed by index until the next expected index is present.
#[derive(Debug)]
pub struct OrderedDeliveryQueue<T> {
    next_expected: usize,
    pending: BTreeMap<usize, T>,
}

impl<T> Default for OrderedDeliveryQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OrderedDeliveryQueue<T> {
    pub fn new() -> Self {
        Self {
            next_expected: 0,
            pending: BTreeMap::new(),
        }
    }

    pub fn next_expected(&self) -> usize {
        self.next_expected
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Buffer an item. Items for already-delivered or already-buffered
    /// indices are rejected so nothing can be delivered twice.
    pub fn push(&mut self, index: usize, item: T) -> Result<(), QueueError> {
        if index < self.next_expected {
            return Err(QueueError::Stale(index));
        }
        if self.pending.contains_key(&index) {
            return Err(QueueError::Duplicate(index));
        }
        self.pending.insert(index, item);
        Ok(())
    }

    /// Release the next item in sequence, if it has arrived.
    pub fn pop_ready(&mut self) -> Option<T> {
        let item = self.pending.remove(&self.next_expected)?;
        self.next_expected += 1;
        Some(item)
    }

    /// Give up on the next expected index and move past it.
    fn skip(&mut self) -> usize {
        let skipped = self.next_expected;
        self.next_expected += 1;
        skipped
    }
}

/// What the consumer sees when it asks for the next unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Unit(SynthesisResult),
    /// All `total` units were delivered.
    Finished,
    /// The run was stopped; nothing more will be delivered.
    Stopped,
}

/// In-order view over the worker pool's result channel.
pub struct OrderedResults {
    queue: OrderedDeliveryQueue<SynthesisResult>,
    results: mpsc::Receiver<SynthesisResult>,
    total: usize,
    stop: watch::Receiver<bool>,
    closed: bool,
}

impl OrderedResults {
    pub fn new(results: mpsc::Receiver<SynthesisResult>, total: usize, stop: watch::Receiver<bool>) -> Self {
        Self {
            queue: OrderedDeliveryQueue::new(),
            results,
            total,
            stop,
            closed: false,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub async fn next(&mut self) -> Delivery {
        loop {
            if *self.stop.borrow() {
                return Delivery::Stopped;
            }
            if self.queue.next_expected() >= self.total {
                return Delivery::Finished;
            }
            if let Some(result) = self.queue.pop_ready() {
                return Delivery::Unit(result);
            }
            if self.closed {
                // Every started unit reports before the channel closes, so a gap here is a lost unit
                let index = self.queue.skip();
                error!("Result channel closed without unit {}", index);
                return Delivery::Unit(SynthesisResult {
                    unit_index: index,
                    text: String::new(),
                    outcome: Outcome::Failure(SynthesisFailure::Missing),
                    elapsed: Default::default(),
                });
            }

            tokio::select! {
                biased;
                _ = stop_requested(&mut self.stop) => return Delivery::Stopped,
                received = self.results.recv() => match received {
                    Some(result) if result.unit_index >= self.total => {
                        warn!("Ignoring result for unit {} beyond run of {}", result.unit_index, self.total);
                    }
                    Some(result) => {
                        if let Err(e) = self.queue.push(result.unit_index, result) {
                            warn!("Ignoring result: {}", e);
                        }
                    }
                    None => self.closed = true,
                },
            }
        }
    }

    /// Wait for every worker already started to report, discarding what is
    /// left. After this no worker still writes into the session.
    pub async fn drain(&mut self) {
        let mut discarded = 0;
        while self.results.recv().await.is_some() {
            discarded += 1;
        }
        self.closed = true;
        if discarded > 0 {
            debug!("Discarded {} result(s) after the run ended", discarded);
        }
    }

    /// Consume as a stream that ends on `Finished` or `Stopped`.
    pub fn into_stream(mut self) -> impl Stream<Item = SynthesisResult> + Send {
        async_stream::stream! {
            while let Delivery::Unit(result) = self.next().await {
                yield result;
            }
        }
    }
}

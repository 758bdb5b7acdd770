//! Delay-based mixing buffer
//!
//! Every packet gets a release time of `now + uniform(min, max)`. Packets are
//! released in release-time order, with arrival order breaking ties, so the
//! order packets leave a relay is decoupled from the order they arrived in.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::config::{OverflowPolicy, RelayConfig};

struct MixEntry<T> {
    release_at: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for MixEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.release_at == other.release_at && self.seq == other.seq
    }
}

impl<T> Eq for MixEntry<T> {}

impl<T> PartialOrd for MixEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for MixEntry<T> {
    // Reversed so the max-heap pops the earliest release first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .release_at
            .cmp(&self.release_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Mixing queue
pub struct Mixer<T> {
    queue: BinaryHeap<MixEntry<T>>,
    next_seq: u64,
    max_depth: usize,
    overflow: OverflowPolicy,
    config: RelayConfig,
}

impl<T> Mixer<T> {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            queue: BinaryHeap::new(),
            next_seq: 0,
            max_depth: config.max_queue_depth.max(1),
            overflow: config.overflow_policy,
            config: config.clone(),
        }
    }

    /// Queue `item` with a random delay. Returns the packet dropped to respect
    /// the queue depth, if any.
    pub fn push(&mut self, item: T) -> Option<T> {
        let delay = self.config.sample_mix_delay();
        self.push_with_delay(item, delay)
    }

    /// Queue `item` for release after exactly `delay`
    pub fn push_with_delay(&mut self, item: T, delay: Duration) -> Option<T> {
        let dropped = if self.queue.len() >= self.max_depth {
            match self.overflow {
                OverflowPolicy::DropNewest => return Some(item),
                OverflowPolicy::DropOldest => self.evict_oldest(),
            }
        } else {
            None
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(MixEntry {
            release_at: Instant::now() + delay,
            seq,
            item,
        });
        dropped
    }

    /// Remove every packet whose release time is at or before `now`, in release order
    pub fn pop_ready(&mut self, now: Instant) -> Vec<T> {
        let mut ready = Vec::new();
        while self.queue.peek().is_some_and(|entry| entry.release_at <= now) {
            if let Some(entry) = self.queue.pop() {
                ready.push(entry.item);
            }
        }
        ready
    }

    /// Remove everything, in release order, regardless of release time
    pub fn drain(&mut self) -> Vec<T> {
        let mut all = Vec::with_capacity(self.queue.len());
        while let Some(entry) = self.queue.pop() {
            all.push(entry.item);
        }
        all
    }

    /// Release time of the next packet
    pub fn next_release(&self) -> Option<Instant> {
        self.queue.peek().map(|entry| entry.release_at)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// The longest-waiting packet, by arrival
    fn evict_oldest(&mut self) -> Option<T> {
        let mut entries = std::mem::take(&mut self.queue).into_vec();
        let oldest = entries
            .iter()
            .enumerate()
            .min_by_key(|(_, entry)| entry.seq)
            .map(|(index, _)| index);
        let dropped = oldest.map(|index| entries.swap_remove(index).item);
        self.queue = entries.into();
        dropped
    }
}

impl<T: Send + 'static> Mixer<T> {
    /// Drive the mixer: queue everything from `inbound`, hand released packets
    /// to `released` one at a time. `on_overflow` sees every packet dropped
    /// because the queue was full.
    ///
    /// When `inbound` closes, the packets still queued are released on
    /// schedule before the driver returns.
    pub async fn run<F>(
        mut self,
        mut inbound: mpsc::Receiver<T>,
        released: mpsc::Sender<T>,
        mut on_overflow: F,
    ) where
        F: FnMut(T) + Send,
    {
        let mut inbound_open = true;
        loop {
            if !inbound_open && self.is_empty() {
                break;
            }
            let deadline = self
                .next_release()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                item = inbound.recv(), if inbound_open => match item {
                    Some(item) => {
                        if let Some(dropped) = self.push(item) {
                            on_overflow(dropped);
                        }
                    }
                    None => {
                        debug!("Mixer input closed, draining {} packets", self.len());
                        inbound_open = false;
                    }
                },
                _ = sleep_until(deadline), if !self.is_empty() => {
                    for item in self.pop_ready(Instant::now()) {
                        if released.send(item).await.is_err() {
                            warn!("Mixer output closed, stopping");
                            return;
                        }
                    }
                }
            }
        }
    }
}

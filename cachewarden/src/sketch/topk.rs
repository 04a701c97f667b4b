//! Bounded-memory top-K hot-key estimator (a HeavyKeeper variant).
//!
//! The sketch keeps `depth x width` counter slots, each holding a key
//! fingerprint and a count. An arriving key hashes to one column per row;
//! matching slots accumulate, contended slots decay the incumbent with
//! probability `decay_base^count` per unit of weight. Keys whose estimated
//! count clears the admission threshold compete for a min-heap of the
//! current top-K candidates.
//!
//! Demoted candidates are pushed onto an advisory *expelled* channel: a hint
//! that the key has lost its slot and is unlikely to be a heavy hitter going
//! forward. The channel is bounded and never blocks the ingestion path;
//! hints are dropped when the consumer lags.
//!
//! Memory is fixed at construction: `depth x width` slots plus at most K
//! heap nodes, independent of input cardinality. Hash collisions are
//! inherent error; the admission threshold suppresses false top-K entries.

use std::path::{Path, PathBuf};

use ahash::RandomState;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::debug;

use super::heap::{HeapNode, TopHeap};

/// Hash discriminant for the fingerprint, kept clear of the row indices.
const FINGERPRINT_TAG: usize = usize::MAX;

/// A key demoted from the top-K candidate set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpelledEvent {
    /// The demoted cache key.
    pub key: PathBuf,
    /// The key's estimated count at the moment of expulsion.
    pub count: u32,
}

/// One entry of a top-K snapshot. Unordered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopEntry {
    pub key: PathBuf,
    pub count: u32,
}

/// A single counter slot.
#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    fingerprint: u64,
    count: u32,
}

/// Top-K heavy-hitter sketch with exponential-decay admission.
///
/// The sketch has no interior locking; callers that share it across tasks
/// wrap it in a mutex covering both the slot array and the heap.
pub struct TopkSketch {
    width: usize,
    depth: usize,
    decay_base: f64,
    min_count: u32,
    slots: Vec<Slot>,
    heap: TopHeap,
    hasher: RandomState,
    rng: SmallRng,
    expelled_tx: mpsc::Sender<ExpelledEvent>,
    expelled_dropped: u64,
}

impl TopkSketch {
    /// Creates a sketch.
    ///
    /// # Arguments
    ///
    /// * `capacity` - maximum number of tracked top-K candidates
    /// * `width` - counter columns per row
    /// * `depth` - independent hash rows
    /// * `decay_base` - displacement decay base, in (0, 1)
    /// * `min_count` - estimated count required for heap admission
    /// * `expelled_tx` - advisory channel for demoted keys
    pub fn new(
        capacity: u32,
        width: usize,
        depth: usize,
        decay_base: f64,
        min_count: u32,
        expelled_tx: mpsc::Sender<ExpelledEvent>,
    ) -> Self {
        let width = width.max(1);
        let depth = depth.max(1);
        Self {
            width,
            depth,
            decay_base,
            min_count: min_count.max(1),
            slots: vec![Slot::default(); width * depth],
            heap: TopHeap::new(capacity.max(1) as usize),
            hasher: RandomState::new(),
            rng: SmallRng::from_entropy(),
            expelled_tx,
            expelled_dropped: 0,
        }
    }

    /// Replaces the hasher. Used by tests that need reproducible placement.
    pub fn with_hasher(mut self, hasher: RandomState) -> Self {
        self.hasher = hasher;
        self
    }

    /// Seeds the decay RNG. Used by tests that need reproducible decay.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    /// Records `increment` observations of `key` and returns the new
    /// estimated count (0 if the key currently owns no slot).
    pub fn add(&mut self, key: &Path, increment: u32) -> u32 {
        let fingerprint = self.hasher.hash_one((FINGERPRINT_TAG, key));
        let mut estimate: Option<u32> = None;

        for row in 0..self.depth {
            let col = (self.hasher.hash_one((row, key)) % self.width as u64) as usize;
            let idx = row * self.width + col;
            let mut slot = self.slots[idx];
            let mut displaced = None;

            if slot.count == 0 {
                slot = Slot {
                    fingerprint,
                    count: increment,
                };
            } else if slot.fingerprint == fingerprint {
                slot.count = slot.count.saturating_add(increment);
            } else {
                // Contended slot: decay the incumbent, one draw per unit of
                // weight. On reaching zero the slot changes owner.
                for _ in 0..increment {
                    if self.rng.gen::<f64>() >= self.decay_base.powf(slot.count as f64) {
                        continue;
                    }
                    slot.count -= 1;
                    if slot.count == 0 {
                        displaced = Some(slot.fingerprint);
                        slot = Slot {
                            fingerprint,
                            count: increment,
                        };
                        break;
                    }
                }
            }

            self.slots[idx] = slot;

            if let Some(old) = displaced {
                // Only keys in the candidate set produce expulsion hints.
                if let Some(loser) = self.heap.remove(old) {
                    self.emit_expelled(loser);
                }
            }
            if slot.fingerprint == fingerprint {
                estimate = Some(estimate.map_or(slot.count, |e| e.min(slot.count)));
            }
        }

        let estimate = estimate.unwrap_or(0);
        if estimate >= self.min_count {
            self.offer(key, fingerprint, estimate);
        }
        estimate
    }

    /// Ages every counter by the decay base and restores heap order, so keys
    /// that stop being accessed lose their rank in wall-clock terms.
    pub fn fading(&mut self) {
        for slot in &mut self.slots {
            slot.count = (slot.count as f64 * self.decay_base) as u32;
        }
        self.heap.fade(self.decay_base);
    }

    /// Snapshot of the current top-K candidates. Unordered.
    pub fn list(&self) -> Vec<TopEntry> {
        self.heap
            .iter()
            .map(|n| TopEntry {
                key: n.key.clone(),
                count: n.count,
            })
            .collect()
    }

    /// Number of tracked top-K candidates.
    pub fn tracked(&self) -> usize {
        self.heap.len()
    }

    /// Total counter slots; fixed at construction.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Offers an estimated count to the candidate heap.
    fn offer(&mut self, key: &Path, fingerprint: u64, estimate: u32) {
        if self.heap.update(fingerprint, estimate) {
            return;
        }
        let node = HeapNode {
            key: key.to_path_buf(),
            count: estimate,
            fingerprint,
        };
        if !self.heap.is_full() {
            self.heap.push(node);
        } else if self.heap.min_count().is_some_and(|min| estimate > min) {
            let loser = self.heap.replace_min(node);
            self.emit_expelled(loser);
        }
    }

    fn emit_expelled(&mut self, loser: HeapNode) {
        let event = ExpelledEvent {
            key: loser.key,
            count: loser.count,
        };
        if self.expelled_tx.try_send(event).is_err() {
            // Advisory stream: dropping hints is fine, blocking ingestion is not.
            self.expelled_dropped += 1;
            debug!(
                dropped = self.expelled_dropped,
                "Expelled channel not accepting events, dropping hint"
            );
        }
    }
}

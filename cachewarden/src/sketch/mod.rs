//! Probabilistic hot-key tracking.

mod heap;
mod topk;

pub use topk::{ExpelledEvent, TopEntry, TopkSketch};

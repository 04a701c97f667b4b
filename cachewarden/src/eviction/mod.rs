//! The eviction controller and its sweep policy.

mod controller;

pub use controller::{ControllerHandle, EvictionController, SweepOutcome};

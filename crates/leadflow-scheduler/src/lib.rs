//! # Leadflow Scheduler
//!
//! Periodic pass over every enabled campaign:
//!
//! ```text
//! tick (tokio interval, single-flight)
//!   ├── replay deferred tracking patches
//!   └── for each enabled campaign
//!         └── for each due enrollment
//!               ├── email  → EmailDispatcher
//!               ├── call   → CallDispatcher
//!               ├── manual → (operator-driven, no dispatch)
//!               └── advance: linear or decision path → save
//! ```
//!
//! A failure inside one enrollment never stops the pass; the enrollment is
//! marked `failed` and stays that way until an operator resets it.

pub mod engine;
pub mod progression;

pub use engine::{SequenceScheduler, TickReport, spawn_scheduler};
pub use progression::{Advance, next_step};

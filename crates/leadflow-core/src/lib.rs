//! # Leadflow Core
//!
//! Shared building blocks for the sequence engine and the webhook gateway.
//!
//! ## Architecture
//! ```text
//! SequenceScheduler ──► Email / Call dispatchers ──► TrackingStore ──► TrackingBackend (SQLite)
//!                                                        │
//!                                                        └──► TtlCache (volatile fallback)
//! provider callbacks ──► WebhookReconciler ──────────────┘
//! ```
//!
//! Everything that talks to the outside world sits behind a trait in
//! [`traits`] so the engine can run against SQLite, SMTP and an HTTP voice
//! provider in production, and against fakes in tests.

pub mod cache;
pub mod config;
pub mod error;
pub mod retry;
pub mod template;
pub mod tracking;
pub mod traits;
pub mod types;

pub use cache::{CallHandle, CallRegistry, TtlCache};
pub use config::LeadflowConfig;
pub use error::{LeadflowError, Result};
pub use retry::{RetryPolicy, with_retry};
pub use template::{Placeholders, render};
pub use tracking::{TrackingStore, WritePath, is_local_id};

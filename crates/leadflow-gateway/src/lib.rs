//! # Leadflow Gateway
//!
//! HTTP surface of the engagement core:
//! - `/open/{id}` and `/click/{id}` record email engagement
//! - `/webhooks/*` take provider callbacks and hand them to the [`WebhookReconciler`]
//! - `/api/v1/*` lets an operator run a pass, list failed enrollments and reset them

pub mod events;
pub mod reconcile;
pub mod routes;
pub mod server;

pub use events::ProviderEvent;
pub use reconcile::{Reconciliation, WebhookReconciler};
pub use server::{AppState, build_router, start};

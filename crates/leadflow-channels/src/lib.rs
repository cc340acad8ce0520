//! Outbound channels: voice calls and email.
//!
//! Both dispatchers create their tracking record *before* the side effect so
//! provider callbacks always have something to attach to.

pub mod email;
pub mod phone;
pub mod vapi;
pub mod voice;

pub use email::{EmailDispatcher, SmtpMailer};
pub use phone::normalize_phone;
pub use vapi::VapiClient;
pub use voice::{CallDispatcher, CallOutcome, CallResult};

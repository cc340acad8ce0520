//! Trait seams between the engine and the outside world.

pub mod backend;
pub mod mailer;
pub mod voice;

pub use backend::{CampaignRepository, TrackingBackend};
pub use mailer::{Mailer, OutboundEmail};
pub use voice::{CallRequest, ProviderCall, VoiceProvider};

//! Outbound mail transport trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A fully rendered message ready for the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub html_body: String,
    /// Sent as the `X-Tracking-Id` header.
    pub tracking_id: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    /// Send one message. Returns the relay's message id when it reports one.
    async fn send(&self, email: &OutboundEmail) -> Result<Option<String>>;
}

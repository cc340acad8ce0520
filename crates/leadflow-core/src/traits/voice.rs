//! Voice-call provider trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;

/// Everything a provider needs to place one outbound call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallRequest {
    /// Canonical `+<digits>` number.
    pub phone_number: String,
    pub customer_name: Option<String>,
    /// Spoken opening line.
    pub first_message: String,
    /// Instructions for the assistant: the rest of the rendered script.
    pub system_prompt: String,
    /// Opaque correlation data echoed back in provider callbacks.
    pub metadata: BTreeMap<String, String>,
    /// Where the provider should deliver status and report events.
    pub callback_url: String,
}

/// What the provider returned on acceptance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderCall {
    pub id: String,
    pub status: String,
}

#[async_trait]
pub trait VoiceProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn place_call(&self, request: &CallRequest) -> Result<ProviderCall>;
}

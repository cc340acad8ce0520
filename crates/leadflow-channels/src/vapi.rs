//! Vapi voice-call provider client.

use async_trait::async_trait;
use leadflow_core::config::VoiceConfig;
use leadflow_core::error::{LeadflowError, Result};
use leadflow_core::traits::{CallRequest, ProviderCall, VoiceProvider};
use serde::Deserialize;
use serde_json::{Value, json};

/// Places outbound calls through the Vapi REST API.
pub struct VapiClient {
    base_url: String,
    api_key: String,
    phone_number_id: String,
    model_provider: String,
    model: String,
    voice_provider: String,
    voice_id: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct CallResponse {
    id: String,
    #[serde(default)]
    status: Option<String>,
}

impl VapiClient {
    pub fn new(config: &VoiceConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            phone_number_id: config.phone_number_id.clone(),
            model_provider: config.model_provider.clone(),
            model: config.model.clone(),
            voice_provider: config.voice_provider.clone(),
            voice_id: config.voice_id.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn payload(&self, request: &CallRequest) -> Value {
        let mut customer = json!({ "number": request.phone_number });
        if let Some(name) = &request.customer_name {
            customer["name"] = json!(name);
        }
        json!({
            "phoneNumberId": self.phone_number_id,
            "customer": customer,
            "assistant": {
                "firstMessage": request.first_message,
                "model": {
                    "provider": self.model_provider,
                    "model": self.model,
                    "messages": [
                        { "role": "system", "content": request.system_prompt }
                    ],
                },
                "voice": {
                    "provider": self.voice_provider,
                    "voiceId": self.voice_id,
                },
                "serverUrl": request.callback_url,
                "serverMessages": ["status-update", "end-of-call-report"],
            },
            "metadata": request.metadata,
        })
    }
}

#[async_trait]
impl VoiceProvider for VapiClient {
    fn name(&self) -> &str {
        "vapi"
    }

    async fn place_call(&self, request: &CallRequest) -> Result<ProviderCall> {
        if self.api_key.is_empty() || self.phone_number_id.is_empty() {
            return Err(LeadflowError::Provider(
                "voice provider API key or phone number id not configured".into(),
            ));
        }

        let url = format!("{}/call", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&self.payload(request))
            .send()
            .await
            .map_err(|e| LeadflowError::Http(format!("vapi connection failed ({url}): {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(LeadflowError::Provider(format!("vapi returned {status}: {text}")));
        }

        let body: CallResponse = resp
            .json()
            .await
            .map_err(|e| LeadflowError::Provider(format!("vapi response: {e}")))?;
        tracing::info!("📞 Vapi accepted call {} to {}", body.id, request.phone_number);
        Ok(ProviderCall {
            id: body.id,
            status: body.status.unwrap_or_else(|| "queued".into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn request() -> CallRequest {
        let mut metadata = BTreeMap::new();
        metadata.insert("tracking_id".to_string(), "call-1".to_string());
        CallRequest {
            phone_number: "+15550001111".into(),
            customer_name: Some("Ada Lovelace".into()),
            first_message: "Hi Ada!".into(),
            system_prompt: "Be brief.".into(),
            metadata,
            callback_url: "https://hooks.example.com/webhooks/voice".into(),
        }
    }

    #[test]
    fn test_payload_shape() {
        let mut config = VoiceConfig::default();
        config.phone_number_id = "pn-1".into();
        let client = VapiClient::new(&config);
        let body = client.payload(&request());

        assert_eq!(body["phoneNumberId"], "pn-1");
        assert_eq!(body["customer"]["number"], "+15550001111");
        assert_eq!(body["customer"]["name"], "Ada Lovelace");
        assert_eq!(body["assistant"]["firstMessage"], "Hi Ada!");
        assert_eq!(body["assistant"]["model"]["messages"][0]["content"], "Be brief.");
        assert_eq!(
            body["assistant"]["serverUrl"],
            "https://hooks.example.com/webhooks/voice"
        );
        assert_eq!(body["metadata"]["tracking_id"], "call-1");
    }

    #[tokio::test]
    async fn test_unconfigured_client_fails_fast() {
        let client = VapiClient::new(&VoiceConfig::default());
        let err = client.place_call(&request()).await.unwrap_err();
        assert!(matches!(err, LeadflowError::Provider(_)));
    }
}

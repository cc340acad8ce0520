//! Call Dispatcher: turns a call step into a provider request.
//!
//! Flow: normalize number → create tracking record → render script →
//! submit to the provider → record the external call id.
//!
//! A provider failure does not fail the dispatch. The call comes back as
//! [`CallOutcome::Degraded`] with a locally minted pseudo id and status
//! `queued`, and the caller decides whether that counts as progress.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use leadflow_core::cache::{CallHandle, CallRegistry};
use leadflow_core::error::{LeadflowError, Result};
use leadflow_core::retry::{RetryPolicy, with_retry};
use leadflow_core::template::{Placeholders, render};
use leadflow_core::tracking::TrackingStore;
use leadflow_core::traits::{CallRequest, VoiceProvider};
use leadflow_core::types::{
    CallScript, Correlation, Lead, TrackingChannel, TrackingPatch, TrackingRecord, TrackingStatus,
};
use serde::Serialize;

use crate::phone::normalize_phone;

/// Identity and initial state of a placed call.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CallResult {
    pub tracking_id: String,
    pub external_call_id: String,
    pub status: TrackingStatus,
    /// Provider error kept for diagnostics on degraded calls.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// The provider accepted the call.
    Dispatched(CallResult),
    /// The provider could not be reached; the call exists only locally.
    Degraded { result: CallResult, reason: String },
}

impl CallOutcome {
    pub fn result(&self) -> &CallResult {
        match self {
            CallOutcome::Dispatched(result) | CallOutcome::Degraded { result, .. } => result,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, CallOutcome::Degraded { .. })
    }
}

pub struct CallDispatcher {
    provider: Arc<dyn VoiceProvider>,
    store: Arc<TrackingStore>,
    registry: Arc<CallRegistry>,
    callback_url: String,
    country_code: String,
    retry: RetryPolicy,
}

impl CallDispatcher {
    pub fn new(
        provider: Arc<dyn VoiceProvider>,
        store: Arc<TrackingStore>,
        registry: Arc<CallRegistry>,
        public_url: &str,
        country_code: &str,
    ) -> Self {
        Self {
            provider,
            store,
            registry,
            callback_url: format!("{}/webhooks/voice", public_url.trim_end_matches('/')),
            country_code: country_code.to_string(),
            retry: RetryPolicy::backend(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn place_call(
        &self,
        phone_number: &str,
        lead: &Lead,
        script: &CallScript,
        correlation: Correlation,
    ) -> Result<CallOutcome> {
        let phone = normalize_phone(phone_number, &self.country_code)?;
        if script.is_empty() {
            return Err(LeadflowError::Validation("call script is empty".into()));
        }

        let record = self
            .store
            .create(TrackingRecord::new(TrackingChannel::Call, &phone, correlation.clone()))
            .await;
        let tracking_id = record.tracking_id.clone();

        let placeholders = Placeholders::for_lead(lead).with_fallbacks();
        let rendered = render_script(script, &placeholders);
        let request = CallRequest {
            phone_number: phone.clone(),
            customer_name: placeholders
                .get("fullName")
                .filter(|n| *n != "there")
                .map(str::to_string),
            first_message: first_message(&rendered, &placeholders),
            system_prompt: system_prompt(&rendered),
            metadata: metadata(&tracking_id, &correlation),
            callback_url: self.callback_url.clone(),
        };

        let provider = &self.provider;
        let req = &request;
        let submitted = with_retry("voice call", self.retry, || async move {
            provider.place_call(req).await
        })
        .await;

        let outcome = match submitted {
            Ok(call) => {
                let status = match TrackingStatus::from_provider(&call.status) {
                    TrackingStatus::Pending => TrackingStatus::Queued,
                    s => s,
                };
                CallOutcome::Dispatched(CallResult {
                    tracking_id: tracking_id.clone(),
                    external_call_id: call.id,
                    status,
                    error: None,
                })
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(
                    "⚠️ {} unreachable for {tracking_id}, queuing locally: {reason}",
                    self.provider.name()
                );
                CallOutcome::Degraded {
                    result: CallResult {
                        tracking_id: tracking_id.clone(),
                        external_call_id: pseudo_call_id(),
                        status: TrackingStatus::Queued,
                        error: Some(reason.clone()),
                    },
                    reason,
                }
            }
        };

        let result = outcome.result();
        self.registry.register(
            &result.external_call_id,
            CallHandle {
                tracking_id: tracking_id.clone(),
                status: result.status,
                correlation,
                updated_at: Utc::now(),
            },
        );
        let patch = TrackingPatch {
            status: Some(result.status),
            external_id: Some(result.external_call_id.clone()),
            error: result.error.clone(),
            ..Default::default()
        };
        if let Err(e) = self.store.update(&tracking_id, &patch).await {
            tracing::warn!("Could not record call id on {tracking_id}: {e}");
        }

        tracing::info!(
            "📞 Call {tracking_id} → {phone} ({}, external id {})",
            result.status.as_str(),
            result.external_call_id
        );
        Ok(outcome)
    }
}

fn render_script(script: &CallScript, p: &Placeholders) -> CallScript {
    let all = |items: &[String]| -> Vec<String> {
        items
            .iter()
            .map(|s| render(s, p))
            .filter(|s| !s.trim().is_empty())
            .collect()
    };
    CallScript {
        greeting: render(&script.greeting, p),
        introduction: render(&script.introduction, p),
        talking_points: all(&script.talking_points),
        questions: all(&script.questions),
        closing: render(&script.closing, p),
    }
}

fn first_message(script: &CallScript, p: &Placeholders) -> String {
    if script.greeting.trim().is_empty() {
        render("Hi {{firstName}}, do you have a quick minute?", p)
    } else {
        script.greeting.trim().to_string()
    }
}

/// Assemble the rendered script into assistant instructions.
fn system_prompt(script: &CallScript) -> String {
    let mut prompt = String::from(
        "You are a friendly sales representative making a short outbound call. \
         Follow the script below, keep every reply brief and conversational, \
         and end the call politely if the person is not interested.\n",
    );
    if !script.introduction.trim().is_empty() {
        prompt.push_str(&format!("\nIntroduction:\n{}\n", script.introduction.trim()));
    }
    if !script.talking_points.is_empty() {
        prompt.push_str("\nTalking points:\n");
        for point in &script.talking_points {
            prompt.push_str(&format!("- {}\n", point.trim()));
        }
    }
    if !script.questions.is_empty() {
        prompt.push_str("\nQuestions to ask:\n");
        for question in &script.questions {
            prompt.push_str(&format!("- {}\n", question.trim()));
        }
    }
    if !script.closing.trim().is_empty() {
        prompt.push_str(&format!("\nClosing:\n{}\n", script.closing.trim()));
    }
    prompt
}

fn metadata(tracking_id: &str, c: &Correlation) -> BTreeMap<String, String> {
    let mut m = BTreeMap::new();
    m.insert("tracking_id".to_string(), tracking_id.to_string());
    for (key, value) in [
        ("enrollment_id", &c.enrollment_id),
        ("step_id", &c.step_id),
        ("lead_id", &c.lead_id),
        ("campaign_id", &c.campaign_id),
    ] {
        if let Some(v) = value {
            m.insert(key.to_string(), v.clone());
        }
    }
    m
}

fn pseudo_call_id() -> String {
    format!("queued-{}", &uuid::Uuid::new_v4().simple().to_string()[..12])
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use leadflow_core::traits::ProviderCall;
    use leadflow_db::SqliteBackend;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeProvider {
        fail: bool,
        seen: Mutex<Vec<CallRequest>>,
    }

    #[async_trait]
    impl VoiceProvider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }

        async fn place_call(&self, request: &CallRequest) -> Result<ProviderCall> {
            self.seen.lock().unwrap().push(request.clone());
            if self.fail {
                Err(LeadflowError::Provider("503 Service Unavailable".into()))
            } else {
                Ok(ProviderCall { id: "vapi-abc".into(), status: "queued".into() })
            }
        }
    }

    fn setup(provider: Arc<FakeProvider>) -> (CallDispatcher, Arc<TrackingStore>, Arc<CallRegistry>) {
        let db = Arc::new(SqliteBackend::open_in_memory().unwrap());
        let store = Arc::new(TrackingStore::new(
            db,
            RetryPolicy::immediate(1),
            Duration::from_secs(60),
            100,
        ));
        let registry = Arc::new(CallRegistry::default());
        let dispatcher = CallDispatcher::new(
            provider,
            store.clone(),
            registry.clone(),
            "https://hooks.example.com/",
            "1",
        )
        .with_retry_policy(RetryPolicy::immediate(2));
        (dispatcher, store, registry)
    }

    fn lead() -> Lead {
        Lead {
            id: "lead-1".into(),
            first_name: Some("Ada".into()),
            company: Some("Analytical Engines".into()),
            ..Default::default()
        }
    }

    fn script() -> CallScript {
        CallScript {
            greeting: "Hi {{firstName}}!".into(),
            introduction: "Calling about {{company}}.".into(),
            talking_points: vec!["We save {{title}} time".into(), "  ".into()],
            questions: vec!["Is now a good time?".into()],
            closing: "Thanks!".into(),
        }
    }

    fn correlation() -> Correlation {
        Correlation {
            enrollment_id: Some("enr-1".into()),
            step_id: Some("step-2".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_dispatched_call_is_tracked() {
        let provider = Arc::new(FakeProvider::default());
        let (dispatcher, store, registry) = setup(provider.clone());

        let outcome = dispatcher
            .place_call("(555) 123-4567", &lead(), &script(), correlation())
            .await
            .unwrap();
        assert!(!outcome.is_degraded());
        let result = outcome.result();
        assert_eq!(result.external_call_id, "vapi-abc");
        assert_eq!(result.status, TrackingStatus::Queued);

        let seen = provider.seen.lock().unwrap()[0].clone();
        assert_eq!(seen.phone_number, "+15551234567");
        assert_eq!(seen.first_message, "Hi Ada!");
        assert!(seen.system_prompt.contains("Calling about Analytical Engines."));
        assert!(seen.system_prompt.contains("- We save your role time"));
        assert_eq!(seen.metadata["tracking_id"], result.tracking_id);
        assert_eq!(seen.metadata["enrollment_id"], "enr-1");
        assert_eq!(seen.callback_url, "https://hooks.example.com/webhooks/voice");

        let rec = store.find_by_external_id("vapi-abc").await.unwrap().unwrap();
        assert_eq!(rec.tracking_id, result.tracking_id);
        assert_eq!(rec.status, TrackingStatus::Queued);
        assert_eq!(registry.lookup("vapi-abc").unwrap().tracking_id, result.tracking_id);
    }

    #[tokio::test]
    async fn test_provider_failure_degrades_to_queued() {
        let provider = Arc::new(FakeProvider { fail: true, ..Default::default() });
        let (dispatcher, store, registry) = setup(provider.clone());

        let outcome = dispatcher
            .place_call("1234567890", &lead(), &script(), correlation())
            .await
            .unwrap();
        let CallOutcome::Degraded { result, reason } = &outcome else {
            panic!("expected degraded outcome, got {outcome:?}");
        };
        assert_eq!(result.status, TrackingStatus::Queued);
        assert!(result.external_call_id.starts_with("queued-"));
        assert!(reason.contains("503"));
        assert_eq!(provider.seen.lock().unwrap().len(), 2);

        let rec = store.get(&result.tracking_id).await.unwrap().unwrap();
        assert_eq!(rec.external_id.as_deref(), Some(result.external_call_id.as_str()));
        assert!(rec.error.as_deref().unwrap().contains("503"));
        assert!(registry.lookup(&result.external_call_id).is_some());
    }

    #[tokio::test]
    async fn test_validation_failures() {
        let provider = Arc::new(FakeProvider::default());
        let (dispatcher, _, _) = setup(provider.clone());

        let err = dispatcher
            .place_call("", &lead(), &script(), correlation())
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let err = dispatcher
            .place_call("1234567890", &lead(), &CallScript::default(), correlation())
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(provider.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_default_first_message_uses_fallback() {
        let p = Placeholders::for_lead(&Lead::default()).with_fallbacks();
        let msg = first_message(&CallScript::default(), &p);
        assert_eq!(msg, "Hi there, do you have a quick minute?");
    }
}

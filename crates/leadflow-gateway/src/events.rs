//! Inbound provider payloads, classified once into [`ProviderEvent`].
//!
//! Two dialects reach the gateway:
//! - the AI voice provider posts JSON envelopes, `{"message": {"type": ...}}`
//! - the telephony carrier posts form callbacks (`CallSid`, `CallStatus`, ...)
//!
//! Nothing downstream looks at raw payloads.

use std::collections::HashMap;

use leadflow_core::types::{ConversationArtifact, Correlation, TrackingStatus};
use serde_json::Value;

/// Provider status change for a call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallStatusEvent {
    pub external_call_id: String,
    pub status: TrackingStatus,
    pub recording_url: Option<String>,
    pub duration_seconds: Option<u32>,
}

/// A call recording became available.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingEvent {
    pub external_call_id: String,
    pub recording_url: String,
    /// Raw carrier status, e.g. `completed`, `in-progress`, `absent`.
    pub status: String,
}

impl RecordingEvent {
    pub fn is_complete(&self) -> bool {
        self.status.eq_ignore_ascii_case("completed")
    }
}

/// Final report for an AI-driven call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndOfCallReport {
    pub external_call_id: String,
    pub status: Option<TrackingStatus>,
    pub ended_reason: Option<String>,
    /// `tracking_id` from the metadata the call was placed with.
    pub metadata_tracking_id: Option<String>,
    /// `tracking_id` from the older customer-level metadata location.
    pub customer_tracking_id: Option<String>,
    pub correlation: Correlation,
    pub customer_number: Option<String>,
    pub transcript: Option<String>,
    pub messages: Option<Value>,
    pub recording_url: Option<String>,
    pub summary: Option<String>,
    pub cost: Option<f64>,
    pub duration_seconds: Option<u32>,
}

impl EndOfCallReport {
    /// Reports without an explicit status mean the call has ended.
    pub fn status(&self) -> TrackingStatus {
        self.status.unwrap_or(TrackingStatus::Completed)
    }

    pub fn artifact(&self, tracking_id: &str) -> ConversationArtifact {
        let mut artifact = ConversationArtifact::new(tracking_id);
        artifact.transcript = self.transcript.clone();
        artifact.messages = self.messages.clone();
        artifact.recording_url = self.recording_url.clone();
        artifact.summary = self.summary.clone();
        artifact
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    CallStatus(CallStatusEvent),
    RecordingReady(RecordingEvent),
    EndOfCallReport(Box<EndOfCallReport>),
    /// Well-formed but nothing to reconcile (other message types, missing ids).
    Ignored(String),
}

impl ProviderEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderEvent::CallStatus(_) => "call-status",
            ProviderEvent::RecordingReady(_) => "recording-ready",
            ProviderEvent::EndOfCallReport(_) => "end-of-call-report",
            ProviderEvent::Ignored(_) => "ignored",
        }
    }

    /// Classify a JSON body from the voice provider.
    ///
    /// Accepts the `{"message": {...}}` envelope and the bare message. A bare
    /// `{externalCallId, status}` object without a `type` is read as a status
    /// update, or as a report when it carries metadata or an artifact.
    pub fn from_json(body: &Value) -> Self {
        let message = body.get("message").filter(|m| m.is_object()).unwrap_or(body);
        match str_at(message, &["type"]).as_deref() {
            Some("status-update") => {
                let Some(id) = call_id(message) else {
                    return ProviderEvent::Ignored("status-update without call id".into());
                };
                let status = str_at(message, &["status"])
                    .or_else(|| str_at(message, &["call", "status"]))
                    .unwrap_or_default();
                ProviderEvent::CallStatus(CallStatusEvent {
                    external_call_id: id,
                    status: TrackingStatus::from_provider(&status),
                    recording_url: str_at(message, &["recordingUrl"]),
                    duration_seconds: secs_at(message, &["durationSeconds"]),
                })
            }
            Some("end-of-call-report") => match call_id(message) {
                Some(id) => ProviderEvent::EndOfCallReport(Box::new(report(id, message))),
                None => ProviderEvent::Ignored("end-of-call-report without call id".into()),
            },
            Some(other) => ProviderEvent::Ignored(format!("message type '{other}'")),
            None => {
                let Some(id) = str_at(message, &["externalCallId"]) else {
                    return ProviderEvent::Ignored("unrecognised payload".into());
                };
                if message.get("metadata").is_some() || message.get("artifact").is_some() {
                    return ProviderEvent::EndOfCallReport(Box::new(report(id, message)));
                }
                let status = str_at(message, &["status"]).unwrap_or_default();
                ProviderEvent::CallStatus(CallStatusEvent {
                    external_call_id: id,
                    status: TrackingStatus::from_provider(&status),
                    recording_url: str_at(message, &["recordingUrl"]),
                    duration_seconds: secs_at(message, &["durationSeconds"]),
                })
            }
        }
    }

    /// Carrier status callback (`CallSid`, `CallStatus`, `CallDuration`, `RecordingUrl`).
    pub fn from_call_status_form(form: &HashMap<String, String>) -> Self {
        let (Some(sid), Some(status)) = (field(form, "CallSid"), field(form, "CallStatus")) else {
            return ProviderEvent::Ignored("status callback without CallSid/CallStatus".into());
        };
        ProviderEvent::CallStatus(CallStatusEvent {
            external_call_id: sid,
            status: TrackingStatus::from_provider(&status),
            recording_url: field(form, "RecordingUrl"),
            duration_seconds: field(form, "CallDuration").and_then(|d| d.parse().ok()),
        })
    }

    /// Carrier recording callback (`CallSid`, `RecordingUrl`, `RecordingStatus`).
    pub fn from_recording_form(form: &HashMap<String, String>) -> Self {
        let (Some(sid), Some(url)) = (field(form, "CallSid"), field(form, "RecordingUrl")) else {
            return ProviderEvent::Ignored("recording callback without CallSid/RecordingUrl".into());
        };
        ProviderEvent::RecordingReady(RecordingEvent {
            external_call_id: sid,
            recording_url: url,
            status: field(form, "RecordingStatus").unwrap_or_else(|| "completed".into()),
        })
    }
}

/// Decode an `application/x-www-form-urlencoded` body. Malformed pairs are skipped.
pub fn parse_form(body: &[u8]) -> HashMap<String, String> {
    let text = String::from_utf8_lossy(body);
    text.split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            let decode = |s: &str| {
                urlencoding::decode(&s.replace('+', " "))
                    .ok()
                    .map(|c| c.into_owned())
            };
            Some((decode(k)?, decode(v)?))
        })
        .collect()
}

fn report(external_call_id: String, m: &Value) -> EndOfCallReport {
    let meta = |key: &str| {
        str_at(m, &["call", "metadata", key]).or_else(|| str_at(m, &["metadata", key]))
    };
    let customer_meta = |key: &str| {
        str_at(m, &["call", "customer", "metadata", key])
            .or_else(|| str_at(m, &["customer", "metadata", key]))
    };
    let artifact = |key: &str| str_at(m, &["artifact", key]).or_else(|| str_at(m, &[key]));

    EndOfCallReport {
        external_call_id,
        status: str_at(m, &["status"]).map(|s| TrackingStatus::from_provider(&s)),
        ended_reason: str_at(m, &["endedReason"]).or_else(|| str_at(m, &["call", "endedReason"])),
        metadata_tracking_id: meta("tracking_id"),
        customer_tracking_id: customer_meta("tracking_id"),
        correlation: Correlation {
            enrollment_id: meta("enrollment_id"),
            step_id: meta("step_id"),
            lead_id: meta("lead_id"),
            campaign_id: meta("campaign_id"),
        },
        customer_number: str_at(m, &["call", "customer", "number"])
            .or_else(|| str_at(m, &["customer", "number"])),
        transcript: artifact("transcript"),
        messages: m
            .pointer("/artifact/messages")
            .or_else(|| m.get("messages"))
            .filter(|v| !v.is_null())
            .cloned(),
        recording_url: artifact("recordingUrl"),
        summary: str_at(m, &["summary"]).or_else(|| str_at(m, &["analysis", "summary"])),
        cost: m.get("cost").and_then(Value::as_f64),
        duration_seconds: secs_at(m, &["durationSeconds"]),
    }
}

fn call_id(message: &Value) -> Option<String> {
    str_at(message, &["call", "id"]).or_else(|| str_at(message, &["externalCallId"]))
}

fn str_at(v: &Value, path: &[&str]) -> Option<String> {
    path.iter()
        .try_fold(v, |cur, key| cur.get(key))?
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn secs_at(v: &Value, path: &[&str]) -> Option<u32> {
    let n = path.iter().try_fold(v, |cur, key| cur.get(key))?.as_f64()?;
    (n >= 0.0).then(|| n.round() as u32)
}

fn field(form: &HashMap<String, String>, key: &str) -> Option<String> {
    form.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()).map(str::to_string)
}

//! Domain model: campaigns, steps, enrollments, tracking records.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An outbound campaign. Steps are loaded separately, ordered by index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub enabled: bool,
}

/// What a step does when it comes due.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Email,
    Call,
    /// Operator-driven touch (e.g. a LinkedIn message). No automatic dispatch.
    Manual,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Email => "email",
            StepType::Call => "call",
            StepType::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "email" => Some(StepType::Email),
            "call" => Some(StepType::Call),
            "manual" | "linkedin" => Some(StepType::Manual),
            _ => None,
        }
    }
}

/// Wait unit for the delay before the next step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WaitUnit {
    Minutes,
    Hours,
    Days,
}

/// Delay between finishing a step and the next one coming due.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WaitTime {
    pub amount: u32,
    pub unit: WaitUnit,
}

impl WaitTime {
    pub fn new(amount: u32, unit: WaitUnit) -> Self {
        Self { amount, unit }
    }

    pub fn as_duration(&self) -> Duration {
        let n = i64::from(self.amount);
        match self.unit {
            WaitUnit::Minutes => Duration::minutes(n),
            WaitUnit::Hours => Duration::hours(n),
            WaitUnit::Days => Duration::days(n),
        }
    }

    /// `now` plus exactly `amount` units.
    pub fn after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.as_duration()
    }
}

impl Default for WaitTime {
    fn default() -> Self {
        Self::new(1, WaitUnit::Days)
    }
}

/// Where a decision path leads once chosen.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "index", rename_all = "snake_case")]
pub enum PathTarget {
    Step(usize),
    End,
}

/// A named branch out of a step ("Replied", "No Reply", ...).
/// `target: None` is a null target and ends the campaign.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecisionPath {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub target: Option<PathTarget>,
}

/// Spoken script for a call step. Every field may carry `{{placeholders}}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallScript {
    #[serde(default)]
    pub greeting: String,
    #[serde(default)]
    pub introduction: String,
    #[serde(default)]
    pub talking_points: Vec<String>,
    #[serde(default)]
    pub questions: Vec<String>,
    #[serde(default)]
    pub closing: String,
}

impl CallScript {
    pub fn is_empty(&self) -> bool {
        self.greeting.trim().is_empty()
            && self.introduction.trim().is_empty()
            && self.talking_points.iter().all(|p| p.trim().is_empty())
            && self.questions.iter().all(|q| q.trim().is_empty())
            && self.closing.trim().is_empty()
    }
}

/// Per-step configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepConfig {
    #[serde(default)]
    pub wait: WaitTime,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub message_template: Option<String>,
    #[serde(default)]
    pub script: Option<CallScript>,
    #[serde(default)]
    pub paths: Vec<DecisionPath>,
}

/// One unit of campaign work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub campaign_id: String,
    pub step_type: StepType,
    pub order_index: usize,
    pub config: StepConfig,
}

/// A prospect.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Lead {
    pub id: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub custom: HashMap<String, String>,
}

/// Enrollment progress state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Pending,
    InProgress,
    Completed,
    /// Terminal until an operator resets it.
    Failed,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Pending => "pending",
            EnrollmentStatus::InProgress => "in_progress",
            EnrollmentStatus::Completed => "completed",
            EnrollmentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EnrollmentStatus::Pending),
            "in_progress" => Some(EnrollmentStatus::InProgress),
            "completed" => Some(EnrollmentStatus::Completed),
            "failed" => Some(EnrollmentStatus::Failed),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, EnrollmentStatus::Pending | EnrollmentStatus::InProgress)
    }
}

/// A lead's progress through one campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: String,
    pub lead_id: String,
    pub campaign_id: String,
    pub current_step_index: usize,
    pub status: EnrollmentStatus,
    pub next_due_at: Option<DateTime<Utc>>,
    pub decision_path_id: Option<String>,
    pub paused_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Enrollment {
    /// A fresh enrollment: pending at step 0, due immediately.
    pub fn new(lead_id: &str, campaign_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: format!("enr-{}", uuid::Uuid::new_v4().simple()),
            lead_id: lead_id.to_string(),
            campaign_id: campaign_id.to_string(),
            current_step_index: 0,
            status: EnrollmentStatus::Pending,
            next_due_at: Some(now),
            decision_path_id: None,
            paused_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Active, not paused, and due at or before `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_active()
            && self.paused_at.is_none()
            && self.next_due_at.is_some_and(|due| due <= now)
    }
}

/// Which side effect a tracking record follows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TrackingChannel {
    Call,
    Email,
}

impl TrackingChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingChannel::Call => "call",
            TrackingChannel::Email => "email",
        }
    }
}

/// Lifecycle of a dispatched side effect.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrackingStatus {
    Pending,
    Queued,
    Ringing,
    InProgress,
    Sent,
    Completed,
    Failed,
}

impl TrackingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingStatus::Pending => "pending",
            TrackingStatus::Queued => "queued",
            TrackingStatus::Ringing => "ringing",
            TrackingStatus::InProgress => "in_progress",
            TrackingStatus::Sent => "sent",
            TrackingStatus::Completed => "completed",
            TrackingStatus::Failed => "failed",
        }
    }

    /// Map a provider status string (either provider dialect) onto our states.
    pub fn from_provider(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "queued" | "scheduled" | "initiated" => TrackingStatus::Queued,
            "ringing" => TrackingStatus::Ringing,
            "in-progress" | "forwarding" | "answered" => TrackingStatus::InProgress,
            "sent" => TrackingStatus::Sent,
            "completed" | "ended" => TrackingStatus::Completed,
            "failed" | "busy" | "no-answer" | "canceled" | "cancelled" => TrackingStatus::Failed,
            _ => TrackingStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TrackingStatus::Completed | TrackingStatus::Failed)
    }

    /// Terminal states are sticky: nothing moves a record back out of them.
    pub fn can_transition_to(&self, next: TrackingStatus) -> bool {
        !self.is_terminal() || next.is_terminal()
    }
}

/// Correlation back to the enrollment and step that caused a side effect.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Correlation {
    #[serde(default)]
    pub enrollment_id: Option<String>,
    #[serde(default)]
    pub step_id: Option<String>,
    #[serde(default)]
    pub lead_id: Option<String>,
    #[serde(default)]
    pub campaign_id: Option<String>,
}

/// Follows one dispatched call or email through its asynchronous lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackingRecord {
    pub tracking_id: String,
    pub channel: TrackingChannel,
    #[serde(default)]
    pub external_id: Option<String>,
    /// Phone number or email address.
    #[serde(default)]
    pub target: String,
    pub status: TrackingStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recording_url: Option<String>,
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub cost: Option<f64>,
    #[serde(default)]
    pub duration_seconds: Option<u32>,
    #[serde(default)]
    pub end_reason: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub open_count: u32,
    #[serde(default)]
    pub click_count: u32,
    #[serde(default)]
    pub first_opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_clicked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub correlation: Correlation,
}

impl TrackingRecord {
    /// New record with a freshly minted tracking id, e.g. `call-20260214093000-1a2b3c4d`.
    pub fn new(channel: TrackingChannel, target: &str, correlation: Correlation) -> Self {
        let now = Utc::now();
        let tracking_id = format!(
            "{}-{}-{}",
            channel.as_str(),
            now.format("%Y%m%d%H%M%S"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        Self::with_id(&tracking_id, channel, target, correlation)
    }

    /// New record with a caller-chosen tracking id.
    pub fn with_id(
        tracking_id: &str,
        channel: TrackingChannel,
        target: &str,
        correlation: Correlation,
    ) -> Self {
        Self {
            tracking_id: tracking_id.to_string(),
            channel,
            external_id: None,
            target: target.to_string(),
            status: TrackingStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            sent_at: None,
            completed_at: None,
            failed_at: None,
            recording_url: None,
            transcript: None,
            cost: None,
            duration_seconds: None,
            end_reason: None,
            error: None,
            subject: None,
            open_count: 0,
            click_count: 0,
            first_opened_at: None,
            last_clicked_at: None,
            correlation,
        }
    }

    /// Apply a patch. Fields present in the patch win; a terminal status is
    /// never replaced by a non-terminal one.
    pub fn apply(&mut self, patch: &TrackingPatch) {
        if let Some(status) = patch.status {
            if self.status.can_transition_to(status) {
                self.status = status;
            } else {
                tracing::debug!(
                    "Ignoring status regression {} → {} on {}",
                    self.status.as_str(),
                    status.as_str(),
                    self.tracking_id
                );
            }
        }
        if let Some(v) = &patch.external_id {
            self.external_id = Some(v.clone());
        }
        if let Some(v) = patch.started_at {
            self.started_at.get_or_insert(v);
        }
        if let Some(v) = patch.sent_at {
            self.sent_at = Some(v);
        }
        if let Some(v) = patch.completed_at {
            self.completed_at = Some(v);
        }
        if let Some(v) = patch.failed_at {
            self.failed_at = Some(v);
        }
        if let Some(v) = &patch.recording_url {
            self.recording_url = Some(v.clone());
        }
        if let Some(v) = &patch.transcript {
            self.transcript = Some(v.clone());
        }
        if let Some(v) = patch.cost {
            self.cost = Some(v);
        }
        if let Some(v) = patch.duration_seconds {
            self.duration_seconds = Some(v);
        }
        if let Some(v) = &patch.end_reason {
            self.end_reason = Some(v.clone());
        }
        if let Some(v) = &patch.error {
            self.error = Some(v.clone());
        }
    }
}

/// Partial update of a tracking record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TrackingPatch {
    pub status: Option<TrackingStatus>,
    pub external_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub recording_url: Option<String>,
    pub transcript: Option<String>,
    pub cost: Option<f64>,
    pub duration_seconds: Option<u32>,
    pub end_reason: Option<String>,
    pub error: Option<String>,
}

impl TrackingPatch {
    pub fn status(status: TrackingStatus) -> Self {
        Self { status: Some(status), ..Self::default() }
    }

    /// Fold a later patch into this one; the later patch wins field by field.
    pub fn merge(&mut self, later: &TrackingPatch) {
        if let Some(s) = later.status {
            match self.status {
                Some(cur) if !cur.can_transition_to(s) => {}
                _ => self.status = Some(s),
            }
        }
        macro_rules! take {
            ($($f:ident),*) => { $( if later.$f.is_some() { self.$f = later.$f.clone(); } )* };
        }
        take!(
            external_id, sent_at, completed_at, failed_at, recording_url, transcript, cost,
            duration_seconds, end_reason, error
        );
        if self.started_at.is_none() {
            self.started_at = later.started_at;
        }
    }
}

/// Conversation content attached to a call once the provider reports it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationArtifact {
    pub id: String,
    pub tracking_id: String,
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub messages: Option<serde_json::Value>,
    #[serde(default)]
    pub recording_url: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ConversationArtifact {
    pub fn new(tracking_id: &str) -> Self {
        Self {
            id: format!("art-{}", uuid::Uuid::new_v4().simple()),
            tracking_id: tracking_id.to_string(),
            transcript: None,
            messages: None,
            recording_url: None,
            summary: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.transcript.as_deref().is_none_or(|t| t.trim().is_empty())
            && self.messages.as_ref().is_none_or(|m| m.is_null())
            && self.recording_url.is_none()
            && self.summary.is_none()
    }
}

/// Open/click engagement signal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EngagementKind {
    Open,
    Click,
}

/// One engagement signal held in the volatile event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngagementEvent {
    pub kind: EngagementKind,
    pub tracking_id: String,
    pub data: serde_json::Value,
    pub at: DateTime<Utc>,
}

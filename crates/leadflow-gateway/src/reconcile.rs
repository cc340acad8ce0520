//! Webhook Reconciler: maps provider events onto tracking records.
//!
//! Provider callbacks can arrive before the dispatcher's own write is
//! visible, more than once, or out of order. The reconciler therefore:
//! - resolves records by external call id first, then by any tracking id it
//!   can find (event metadata, legacy customer metadata, the call registry)
//! - synthesizes a minimal record instead of dropping an uncorrelated event
//! - never moves a record out of a terminal status
//! - never returns an error to the HTTP layer

use std::sync::Arc;

use chrono::Utc;
use leadflow_core::cache::{CallHandle, CallRegistry};
use leadflow_core::error::Result;
use leadflow_core::tracking::TrackingStore;
use leadflow_core::types::{
    ConversationArtifact, Correlation, TrackingChannel, TrackingPatch, TrackingRecord,
    TrackingStatus,
};
use serde::Serialize;

use crate::events::{CallStatusEvent, EndOfCallReport, ProviderEvent, RecordingEvent};

/// Prefix of tracking ids derived from an external call id.
pub const EXTERNAL_PREFIX: &str = "ext-";

/// What happened to one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum Reconciliation {
    Updated(String),
    Created(String),
    Skipped(String),
    /// Processing stopped part way; logged and acknowledged anyway.
    Absorbed(String),
}

pub struct WebhookReconciler {
    store: Arc<TrackingStore>,
    registry: Arc<CallRegistry>,
}

impl WebhookReconciler {
    pub fn new(store: Arc<TrackingStore>, registry: Arc<CallRegistry>) -> Self {
        Self { store, registry }
    }

    /// Reconcile one event. Failures are logged and reported as
    /// [`Reconciliation::Absorbed`], never propagated.
    pub async fn handle(&self, event: ProviderEvent) -> Reconciliation {
        let kind = event.kind();
        let result = match event {
            ProviderEvent::CallStatus(ev) => self.call_status(ev).await,
            ProviderEvent::RecordingReady(ev) => self.recording_ready(ev).await,
            ProviderEvent::EndOfCallReport(ev) => self.end_of_call(*ev).await,
            ProviderEvent::Ignored(reason) => {
                tracing::debug!("Webhook ignored: {reason}");
                Ok(Reconciliation::Skipped(reason))
            }
        };
        result.unwrap_or_else(|e| {
            tracing::warn!("⚠️ {kind} event only partly applied: {e}");
            Reconciliation::Absorbed(e.to_string())
        })
    }

    async fn call_status(&self, ev: CallStatusEvent) -> Result<Reconciliation> {
        self.registry.update_status(&ev.external_call_id, ev.status);
        let hint = self.registry.lookup(&ev.external_call_id).map(|h| h.tracking_id);

        match self.resolve(&ev.external_call_id, hint.as_deref()).await? {
            Some(record) => {
                let mut patch = lifecycle_patch(&record, ev.status);
                patch.external_id = Some(ev.external_call_id.clone());
                patch.recording_url = ev.recording_url;
                patch.duration_seconds = ev.duration_seconds;
                self.store.update(&record.tracking_id, &patch).await?;
                tracing::debug!(
                    "📶 Call {} → {} ({})",
                    ev.external_call_id,
                    ev.status.as_str(),
                    record.tracking_id
                );
                Ok(Reconciliation::Updated(record.tracking_id))
            }
            None => {
                let mut record = self.blank(&ev.external_call_id, None, "", Correlation::default());
                let patch = TrackingPatch {
                    recording_url: ev.recording_url,
                    duration_seconds: ev.duration_seconds,
                    ..lifecycle_patch(&record, ev.status)
                };
                record.apply(&patch);
                let created = self.persist(record, &ev.external_call_id).await;
                tracing::info!(
                    "📶 Status for unknown call {}; created {}",
                    ev.external_call_id,
                    created.tracking_id
                );
                Ok(Reconciliation::Created(created.tracking_id))
            }
        }
    }

    async fn recording_ready(&self, ev: RecordingEvent) -> Result<Reconciliation> {
        if !ev.is_complete() {
            return Ok(Reconciliation::Skipped(format!(
                "recording for {} is {}",
                ev.external_call_id, ev.status
            )));
        }
        let hint = self.registry.lookup(&ev.external_call_id).map(|h| h.tracking_id);
        let (tracking_id, outcome) = match self.resolve(&ev.external_call_id, hint.as_deref()).await? {
            Some(record) => {
                let patch = TrackingPatch {
                    external_id: Some(ev.external_call_id.clone()),
                    recording_url: Some(ev.recording_url.clone()),
                    ..Default::default()
                };
                self.store.update(&record.tracking_id, &patch).await?;
                (record.tracking_id.clone(), Reconciliation::Updated(record.tracking_id))
            }
            None => {
                let mut record = self.blank(&ev.external_call_id, None, "", Correlation::default());
                record.recording_url = Some(ev.recording_url.clone());
                let created = self.persist(record, &ev.external_call_id).await;
                (created.tracking_id.clone(), Reconciliation::Created(created.tracking_id))
            }
        };

        let mut artifact = ConversationArtifact::new(&tracking_id);
        artifact.recording_url = Some(ev.recording_url);
        self.store.add_artifact(artifact).await;
        tracing::info!("🎙️ Recording stored for {tracking_id}");
        Ok(outcome)
    }

    async fn end_of_call(&self, report: EndOfCallReport) -> Result<Reconciliation> {
        let external_id = report.external_call_id.clone();
        let status = report.status();
        let registered = self.registry.lookup(&external_id);
        let resolved = report
            .metadata_tracking_id
            .clone()
            .or_else(|| report.customer_tracking_id.clone())
            .or_else(|| registered.as_ref().map(|h| h.tracking_id.clone()));
        self.registry.update_status(&external_id, status);

        let (record, created) = match self.resolve(&external_id, resolved.as_deref()).await? {
            Some(record) => (record, false),
            None => {
                let correlation = registered
                    .map(|h| h.correlation)
                    .filter(|c| *c != Correlation::default())
                    .unwrap_or_else(|| report.correlation.clone());
                let target = report.customer_number.clone().unwrap_or_default();
                let record = self.blank(&external_id, resolved.as_deref(), &target, correlation);
                (self.persist(record, &external_id).await, true)
            }
        };
        let tracking_id = record.tracking_id.clone();

        let mut patch = lifecycle_patch(&record, status);
        patch.external_id = Some(external_id.clone());
        if status.is_terminal() {
            patch.end_reason = report.ended_reason.clone();
            patch.transcript = report.transcript.clone();
            patch.recording_url = report.recording_url.clone();
            patch.cost = report.cost;
            patch.duration_seconds = report.duration_seconds;

            let artifact = report.artifact(&tracking_id);
            if !artifact.is_empty() {
                self.store.add_artifact(artifact).await;
            }
        }
        self.store.update(&tracking_id, &patch).await?;

        tracing::info!(
            "📋 End-of-call report for {external_id} → {tracking_id} ({}{})",
            status.as_str(),
            report.ended_reason.as_deref().map(|r| format!(", {r}")).unwrap_or_default()
        );
        Ok(if created {
            Reconciliation::Created(tracking_id)
        } else {
            Reconciliation::Updated(tracking_id)
        })
    }

    /// Find a record by external id, falling back to a known tracking id.
    async fn locate(&self, external_id: &str, tracking_id: Option<&str>) -> Result<Option<TrackingRecord>> {
        if let Some(record) = self.store.find_by_external_id(external_id).await? {
            return Ok(Some(record));
        }
        let derived = format!("{EXTERNAL_PREFIX}{external_id}");
        for id in tracking_id.into_iter().chain([derived.as_str()]) {
            if let Some(record) = self.store.get(id).await? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// [`locate`](Self::locate), except that a failed read falls back to the
    /// known tracking id. The store then defers the patch until the backend
    /// is back, instead of the event being lost.
    async fn resolve(
        &self,
        external_id: &str,
        tracking_id: Option<&str>,
    ) -> Result<Option<TrackingRecord>> {
        match self.locate(external_id, tracking_id).await {
            Ok(found) => Ok(found),
            Err(e) => {
                let Some(id) = tracking_id else { return Err(e) };
                tracing::warn!("⚠️ Lookup for call {external_id} failed ({e}); patching {id} blind");
                let mut record =
                    TrackingRecord::with_id(id, TrackingChannel::Call, "", Correlation::default());
                record.external_id = Some(external_id.to_string());
                Ok(Some(record))
            }
        }
    }

    fn blank(
        &self,
        external_id: &str,
        tracking_id: Option<&str>,
        target: &str,
        correlation: Correlation,
    ) -> TrackingRecord {
        let id = tracking_id
            .map(str::to_string)
            .unwrap_or_else(|| format!("{EXTERNAL_PREFIX}{external_id}"));
        let mut record = TrackingRecord::with_id(&id, TrackingChannel::Call, target, correlation);
        record.external_id = Some(external_id.to_string());
        record
    }

    /// Store a synthesized record and remember it under the external id so
    /// later events for the same call find it even if it only lives locally.
    async fn persist(&self, record: TrackingRecord, external_id: &str) -> TrackingRecord {
        let created = self.store.create(record).await;
        self.registry.register(
            external_id,
            CallHandle {
                tracking_id: created.tracking_id.clone(),
                status: created.status,
                correlation: created.correlation.clone(),
                updated_at: Utc::now(),
            },
        );
        created
    }
}

/// Status plus the matching lifecycle timestamp. Timestamps already set on
/// the record are kept.
fn lifecycle_patch(record: &TrackingRecord, status: TrackingStatus) -> TrackingPatch {
    let now = Utc::now();
    let mut patch = TrackingPatch::status(status);
    match status {
        TrackingStatus::Ringing | TrackingStatus::InProgress => {
            patch.started_at = Some(now);
        }
        TrackingStatus::Completed if record.completed_at.is_none() => {
            patch.completed_at = Some(now);
        }
        TrackingStatus::Failed if record.failed_at.is_none() => {
            patch.failed_at = Some(now);
        }
        _ => {}
    }
    patch
}

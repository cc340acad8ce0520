//! Tracking Store: durable rows with a volatile in-process fallback.
//!
//! Reads and writes go to the [`TrackingBackend`] through the retry wrapper.
//! When the backend refuses a write the store keeps working from memory:
//!
//! - `create` failures mint a `local-…` id and keep the record in a TTL cache
//! - `update` failures after the privileged attempt become *deferred patches*,
//!   overlaid on reads and replayed by [`TrackingStore::replay_deferred`]
//! - open/click signals that cannot be counted durably land in a local event log
//!
//! Everything held in memory is lost on restart. Durable rows are not.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;

use crate::cache::TtlCache;
use crate::config::LeadflowConfig;
use crate::error::{LeadflowError, Result};
use crate::retry::{RetryPolicy, with_retry};
use crate::traits::TrackingBackend;
use crate::types::{
    ConversationArtifact, EngagementEvent, EngagementKind, TrackingPatch, TrackingRecord,
};

/// Prefix of tracking ids that only exist in process memory.
pub const LOCAL_PREFIX: &str = "local-";

pub fn is_local_id(tracking_id: &str) -> bool {
    tracking_id.starts_with(LOCAL_PREFIX)
}

/// Which path an update actually took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePath {
    Durable,
    Privileged,
    Local,
    /// Held in memory until the backend accepts it again.
    Deferred,
}

pub struct TrackingStore {
    backend: Arc<dyn TrackingBackend>,
    retry: RetryPolicy,
    local: TtlCache<TrackingRecord>,
    local_artifacts: TtlCache<Vec<ConversationArtifact>>,
    events: TtlCache<Vec<EngagementEvent>>,
    deferred: TtlCache<TrackingPatch>,
}

impl TrackingStore {
    pub fn new(
        backend: Arc<dyn TrackingBackend>,
        retry: RetryPolicy,
        ttl: Duration,
        max_entries: usize,
    ) -> Self {
        Self {
            backend,
            retry,
            local: TtlCache::new(ttl, max_entries),
            local_artifacts: TtlCache::new(ttl, max_entries),
            events: TtlCache::new(ttl, max_entries),
            deferred: TtlCache::new(ttl, max_entries),
        }
    }

    pub fn from_config(backend: Arc<dyn TrackingBackend>, config: &LeadflowConfig) -> Self {
        Self::new(
            backend,
            config.retry.backend_policy(),
            config.cache.ttl(),
            config.cache.max_entries,
        )
    }

    /// Persist a new record. Never fails: when the durable insert is refused
    /// the record is re-keyed with a `local-` id and held in memory.
    pub async fn create(&self, mut record: TrackingRecord) -> TrackingRecord {
        let backend = &self.backend;
        let rec = &record;
        let result = with_retry("tracking insert", self.retry, || async move {
            backend.insert_tracking(rec).await
        })
        .await;

        match result {
            Ok(()) => {
                tracing::debug!("Tracking record {} stored durably", record.tracking_id);
            }
            Err(e) => {
                let local_id = mint_local_id();
                tracing::warn!(
                    "⚠️ Durable tracking insert failed ({e}); holding {} locally as {local_id}",
                    record.tracking_id
                );
                record.tracking_id = local_id;
                self.local.insert(&record.tracking_id, record.clone());
            }
        }
        record
    }

    /// Apply a patch. Local ids go to memory; durable ids try the backend,
    /// then the privileged path on a permission failure, then defer.
    pub async fn update(&self, tracking_id: &str, patch: &TrackingPatch) -> Result<WritePath> {
        if is_local_id(tracking_id) {
            return if self.local.update(tracking_id, |rec| rec.apply(patch)) {
                Ok(WritePath::Local)
            } else {
                Err(LeadflowError::NotFound(format!("tracking record {tracking_id}")))
            };
        }

        // A pending deferred patch is older than this one: write both, later fields win.
        let pending = self.deferred.get(tracking_id);
        let effective = match &pending {
            Some(older) => {
                let mut merged = older.clone();
                merged.merge(patch);
                merged
            }
            None => patch.clone(),
        };

        let backend = &self.backend;
        let eff = &effective;
        let result = with_retry("tracking update", self.retry, || async move {
            backend.update_tracking(tracking_id, eff).await
        })
        .await;

        match result {
            Ok(true) => {
                self.settle_deferred(tracking_id, pending.as_ref());
                Ok(WritePath::Durable)
            }
            Ok(false) => Err(LeadflowError::NotFound(format!("tracking record {tracking_id}"))),
            Err(e) if e.is_permission_denied() => {
                tracing::warn!("Tracking update for {tracking_id} denied, trying privileged path");
                match self.backend.update_tracking_privileged(tracking_id, &effective).await {
                    Ok(true) => {
                        self.settle_deferred(tracking_id, pending.as_ref());
                        Ok(WritePath::Privileged)
                    }
                    Ok(false) => {
                        Err(LeadflowError::NotFound(format!("tracking record {tracking_id}")))
                    }
                    Err(e) => {
                        tracing::warn!("Privileged tracking update for {tracking_id} failed: {e}");
                        Ok(self.defer(tracking_id, patch))
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Tracking update for {tracking_id} failed: {e}");
                Ok(self.defer(tracking_id, patch))
            }
        }
    }

    /// Drop the deferred patch that was just written through, unless another
    /// one was merged into it meanwhile.
    fn settle_deferred(&self, tracking_id: &str, written: Option<&TrackingPatch>) {
        let Some(written) = written else { return };
        if self.deferred.get(tracking_id).as_ref() == Some(written) {
            self.deferred.remove(tracking_id);
            tracing::debug!("Deferred patch for {tracking_id} folded into a newer write");
        }
    }

    fn defer(&self, tracking_id: &str, patch: &TrackingPatch) -> WritePath {
        self.deferred
            .upsert(tracking_id, TrackingPatch::default, |pending| pending.merge(patch));
        tracing::warn!("⏸️ Deferred tracking patch for {tracking_id}");
        WritePath::Deferred
    }

    /// Look up by tracking id, with any deferred patch applied on top.
    pub async fn get(&self, tracking_id: &str) -> Result<Option<TrackingRecord>> {
        if is_local_id(tracking_id) {
            return Ok(self.local.get(tracking_id));
        }
        let backend = &self.backend;
        let found = with_retry("tracking read", self.retry, || async move {
            backend.find_by_tracking_id(tracking_id).await
        })
        .await?;
        Ok(found.map(|rec| self.overlay(rec)))
    }

    /// Durable lookup only: local records have no external id index.
    pub async fn find_by_external_id(&self, external_id: &str) -> Result<Option<TrackingRecord>> {
        let backend = &self.backend;
        let found = with_retry("tracking lookup", self.retry, || async move {
            backend.find_by_external_id(external_id).await
        })
        .await?;
        Ok(found.map(|rec| self.overlay(rec)))
    }

    fn overlay(&self, mut record: TrackingRecord) -> TrackingRecord {
        if let Some(patch) = self.deferred.get(&record.tracking_id) {
            record.apply(&patch);
        }
        record
    }

    /// Append to the volatile event log.
    pub fn append_event(&self, kind: EngagementKind, tracking_id: &str, data: serde_json::Value) {
        let event = EngagementEvent {
            kind,
            tracking_id: tracking_id.to_string(),
            data,
            at: Utc::now(),
        };
        self.events.upsert(tracking_id, Vec::new, |log| log.push(event));
    }

    pub fn query_events(&self, kind: EngagementKind, tracking_id: &str) -> Vec<EngagementEvent> {
        self.events
            .get(tracking_id)
            .unwrap_or_default()
            .into_iter()
            .filter(|e| e.kind == kind)
            .collect()
    }

    /// Count an open or click. Falls back to the local event log when the
    /// row is local, unknown, or the backend is unavailable.
    pub async fn record_engagement(
        &self,
        tracking_id: &str,
        kind: EngagementKind,
        data: serde_json::Value,
    ) -> WritePath {
        let now = Utc::now();
        if is_local_id(tracking_id) {
            self.local.update(tracking_id, |rec| match kind {
                EngagementKind::Open => {
                    rec.open_count += 1;
                    rec.first_opened_at.get_or_insert(now);
                }
                EngagementKind::Click => {
                    rec.click_count += 1;
                    rec.last_clicked_at = Some(now);
                }
            });
            self.append_event(kind, tracking_id, data);
            return WritePath::Local;
        }

        let backend = &self.backend;
        let result = with_retry("engagement write", self.retry, || async move {
            backend.record_engagement(tracking_id, kind, now).await
        })
        .await;
        match result {
            Ok(true) => WritePath::Durable,
            Ok(false) => {
                tracing::debug!("No tracking row for {tracking_id}; logging event locally");
                self.append_event(kind, tracking_id, data);
                WritePath::Local
            }
            Err(e) => {
                tracing::warn!("Engagement write for {tracking_id} failed ({e}); logging locally");
                self.append_event(kind, tracking_id, data);
                WritePath::Local
            }
        }
    }

    /// Attach a conversation artifact. Kept in memory if the backend refuses it.
    pub async fn add_artifact(&self, artifact: ConversationArtifact) -> WritePath {
        if !is_local_id(&artifact.tracking_id) {
            let backend = &self.backend;
            let art = &artifact;
            let result = with_retry("artifact insert", self.retry, || async move {
                backend.insert_artifact(art).await
            })
            .await;
            match result {
                Ok(()) => return WritePath::Durable,
                Err(e) => tracing::warn!(
                    "Artifact insert for {} failed ({e}); holding locally",
                    artifact.tracking_id
                ),
            }
        }
        let key = artifact.tracking_id.clone();
        self.local_artifacts.upsert(&key, Vec::new, |list| list.push(artifact));
        WritePath::Local
    }

    /// Durable artifacts followed by any held in memory.
    pub async fn artifacts(&self, tracking_id: &str) -> Result<Vec<ConversationArtifact>> {
        let mut all = if is_local_id(tracking_id) {
            Vec::new()
        } else {
            let backend = &self.backend;
            with_retry("artifact read", self.retry, || async move {
                backend.artifacts(tracking_id).await
            })
            .await?
        };
        all.extend(self.local_artifacts.get(tracking_id).unwrap_or_default());
        Ok(all)
    }

    /// Push deferred patches to the backend. Returns how many were flushed.
    pub async fn replay_deferred(&self) -> usize {
        let pending = self.deferred.entries();
        if pending.is_empty() {
            return 0;
        }
        let mut flushed = 0;
        for (tracking_id, patch) in pending {
            let result = match self.backend.update_tracking(&tracking_id, &patch).await {
                Err(e) if e.is_permission_denied() => {
                    self.backend.update_tracking_privileged(&tracking_id, &patch).await
                }
                other => other,
            };
            match result {
                Ok(matched) => {
                    if !matched {
                        tracing::warn!("Dropping deferred patch for missing row {tracking_id}");
                    }
                    // A patch merged in meanwhile stays for the next pass.
                    if self.deferred.get(&tracking_id).as_ref() == Some(&patch) {
                        self.deferred.remove(&tracking_id);
                    }
                    if matched {
                        flushed += 1;
                    }
                }
                Err(e) => tracing::debug!("Deferred patch for {tracking_id} still pending: {e}"),
            }
        }
        if flushed > 0 {
            tracing::info!("🔁 Replayed {flushed} deferred tracking patch(es)");
        }
        flushed
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.len()
    }

    pub fn local_count(&self) -> usize {
        self.local.len()
    }
}

/// `local-<unix millis>-<6 random chars>`.
fn mint_local_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(6)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{LOCAL_PREFIX}{}-{suffix}", Utc::now().timestamp_millis())
}

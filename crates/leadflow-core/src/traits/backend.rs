//! Durable backend traits.
//!
//! The scheduler reads campaign definitions and writes enrollment state
//! through [`CampaignRepository`]; the tracking store persists tracking rows
//! and conversation artifacts through [`TrackingBackend`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{
    Campaign, ConversationArtifact, EngagementKind, Enrollment, Lead, Step, TrackingPatch,
    TrackingRecord,
};

/// Campaign definitions and enrollment state.
#[async_trait]
pub trait CampaignRepository: Send + Sync {
    async fn enabled_campaigns(&self) -> Result<Vec<Campaign>>;

    /// Steps of one campaign, ordered by index.
    async fn steps(&self, campaign_id: &str) -> Result<Vec<Step>>;

    /// Pending or in-progress, unpaused enrollments due at or before `now`.
    async fn due_enrollments(&self, campaign_id: &str, now: DateTime<Utc>)
    -> Result<Vec<Enrollment>>;

    async fn lead(&self, lead_id: &str) -> Result<Option<Lead>>;

    async fn enrollment(&self, enrollment_id: &str) -> Result<Option<Enrollment>>;

    async fn create_enrollment(&self, enrollment: &Enrollment) -> Result<()>;

    /// Overwrite the mutable progress fields of an existing enrollment.
    async fn save_enrollment(&self, enrollment: &Enrollment) -> Result<()>;

    async fn failed_enrollments(&self) -> Result<Vec<Enrollment>>;
}

/// Durable tracking rows.
///
/// Update methods return `Ok(false)` when no row matched. Authorization
/// failures must surface as [`LeadflowError::PermissionDenied`](crate::LeadflowError::PermissionDenied)
/// so the store can take the privileged path.
#[async_trait]
pub trait TrackingBackend: Send + Sync {
    async fn insert_tracking(&self, record: &TrackingRecord) -> Result<()>;

    async fn update_tracking(&self, tracking_id: &str, patch: &TrackingPatch) -> Result<bool>;

    /// Same write as [`update_tracking`](Self::update_tracking), performed with
    /// elevated rights. Only used after a permission failure.
    async fn update_tracking_privileged(
        &self,
        tracking_id: &str,
        patch: &TrackingPatch,
    ) -> Result<bool>;

    async fn find_by_tracking_id(&self, tracking_id: &str) -> Result<Option<TrackingRecord>>;

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<TrackingRecord>>;

    async fn insert_artifact(&self, artifact: &ConversationArtifact) -> Result<()>;

    async fn artifacts(&self, tracking_id: &str) -> Result<Vec<ConversationArtifact>>;

    /// Bump the open or click counter of a row.
    async fn record_engagement(
        &self,
        tracking_id: &str,
        kind: EngagementKind,
        at: DateTime<Utc>,
    ) -> Result<bool>;
}

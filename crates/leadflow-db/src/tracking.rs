//! Tracking rows and conversation artifacts.
//!
//! The full record is kept as JSON in `data`; `status` and `external_id` are
//! copied into their own columns for lookups. Patches are applied in Rust
//! with [`TrackingRecord::apply`] so both write paths share one set of rules.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadflow_core::error::Result;
use leadflow_core::traits::TrackingBackend;
use leadflow_core::types::{ConversationArtifact, EngagementKind, TrackingPatch, TrackingRecord};
use rusqlite::{Connection, OptionalExtension, params};

use crate::{SqliteBackend, db_err, ts};

fn load(conn: &Connection, column: &str, key: &str) -> Result<Option<TrackingRecord>> {
    let sql = format!("SELECT data FROM tracking WHERE {column} = ?1 ORDER BY created_at DESC LIMIT 1");
    let data: Option<String> = conn
        .query_row(&sql, params![key], |row| row.get(0))
        .optional()
        .map_err(db_err)?;
    match data {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

fn store(conn: &Connection, record: &TrackingRecord) -> Result<()> {
    let data = serde_json::to_string(record)?;
    conn.execute(
        "UPDATE tracking SET external_id = ?2, status = ?3, data = ?4, updated_at = ?5
         WHERE tracking_id = ?1",
        params![
            record.tracking_id,
            record.external_id,
            record.status.as_str(),
            data,
            ts(Utc::now())
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

/// Read-modify-write of one row on the given connection.
fn patch_row(conn: &Connection, tracking_id: &str, patch: &TrackingPatch) -> Result<bool> {
    let Some(mut record) = load(conn, "tracking_id", tracking_id)? else {
        return Ok(false);
    };
    record.apply(patch);
    store(conn, &record)?;
    Ok(true)
}

#[async_trait]
impl TrackingBackend for SqliteBackend {
    async fn insert_tracking(&self, record: &TrackingRecord) -> Result<()> {
        let data = serde_json::to_string(record)?;
        let now = ts(Utc::now());
        self.lock()?
            .execute(
                "INSERT INTO tracking (tracking_id, channel, external_id, status, data, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    record.tracking_id,
                    record.channel.as_str(),
                    record.external_id,
                    record.status.as_str(),
                    data,
                    now
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    async fn update_tracking(&self, tracking_id: &str, patch: &TrackingPatch) -> Result<bool> {
        let conn = self.lock()?;
        patch_row(&conn, tracking_id, patch)
    }

    async fn update_tracking_privileged(
        &self,
        tracking_id: &str,
        patch: &TrackingPatch,
    ) -> Result<bool> {
        let conn = self.lock_service()?;
        let updated = patch_row(&conn, tracking_id, patch)?;
        tracing::info!("🔑 Privileged tracking write for {tracking_id} (matched: {updated})");
        Ok(updated)
    }

    async fn find_by_tracking_id(&self, tracking_id: &str) -> Result<Option<TrackingRecord>> {
        let conn = self.lock()?;
        load(&conn, "tracking_id", tracking_id)
    }

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<TrackingRecord>> {
        let conn = self.lock()?;
        load(&conn, "external_id", external_id)
    }

    async fn insert_artifact(&self, artifact: &ConversationArtifact) -> Result<()> {
        let data = serde_json::to_string(artifact)?;
        self.lock()?
            .execute(
                "INSERT INTO artifacts (id, tracking_id, data, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![artifact.id, artifact.tracking_id, data, ts(artifact.created_at)],
            )
            .map_err(db_err)?;
        Ok(())
    }

    async fn artifacts(&self, tracking_id: &str) -> Result<Vec<ConversationArtifact>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT data FROM artifacts WHERE tracking_id = ?1 ORDER BY created_at")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![tracking_id], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(Into::into))
            .collect()
    }

    async fn record_engagement(
        &self,
        tracking_id: &str,
        kind: EngagementKind,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let Some(mut record) = load(&conn, "tracking_id", tracking_id)? else {
            return Ok(false);
        };
        match kind {
            EngagementKind::Open => {
                record.open_count += 1;
                record.first_opened_at.get_or_insert(at);
            }
            EngagementKind::Click => {
                record.click_count += 1;
                record.last_clicked_at = Some(at);
            }
        }
        store(&conn, &record)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadflow_core::types::{Correlation, TrackingChannel, TrackingStatus};

    fn record() -> TrackingRecord {
        TrackingRecord::new(
            TrackingChannel::Call,
            "+15550001111",
            Correlation { enrollment_id: Some("enr-1".into()), ..Default::default() },
        )
    }

    #[tokio::test]
    async fn test_insert_update_find() {
        let db = SqliteBackend::open_in_memory().unwrap();
        let rec = record();
        db.insert_tracking(&rec).await.unwrap();

        let patch = TrackingPatch {
            status: Some(TrackingStatus::Queued),
            external_id: Some("vapi-123".into()),
            ..Default::default()
        };
        assert!(db.update_tracking(&rec.tracking_id, &patch).await.unwrap());
        assert!(!db.update_tracking("call-nope", &patch).await.unwrap());

        let found = db.find_by_external_id("vapi-123").await.unwrap().unwrap();
        assert_eq!(found.tracking_id, rec.tracking_id);
        assert_eq!(found.status, TrackingStatus::Queued);
        assert_eq!(found.correlation.enrollment_id.as_deref(), Some("enr-1"));
    }

    #[tokio::test]
    async fn test_terminal_status_sticks_in_db() {
        let db = SqliteBackend::open_in_memory().unwrap();
        let rec = record();
        db.insert_tracking(&rec).await.unwrap();
        db.update_tracking(&rec.tracking_id, &TrackingPatch::status(TrackingStatus::Completed))
            .await
            .unwrap();
        db.update_tracking(&rec.tracking_id, &TrackingPatch::status(TrackingStatus::InProgress))
            .await
            .unwrap();
        let got = db.find_by_tracking_id(&rec.tracking_id).await.unwrap().unwrap();
        assert_eq!(got.status, TrackingStatus::Completed);
    }

    #[tokio::test]
    async fn test_privileged_path_on_restricted_db() {
        let dir = std::env::temp_dir().join(format!("leadflow-db-priv-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("t.db");
        let path = path.to_str().unwrap();

        let rec = record();
        {
            let writer = SqliteBackend::open(path).unwrap();
            writer.insert_tracking(&rec).await.unwrap();
        }

        let db = SqliteBackend::open_restricted(path).unwrap();
        let patch = TrackingPatch::status(TrackingStatus::Ringing);
        let err = db.update_tracking(&rec.tracking_id, &patch).await.unwrap_err();
        assert!(err.is_permission_denied(), "got {err}");

        assert!(db.update_tracking_privileged(&rec.tracking_id, &patch).await.unwrap());
        let got = db.find_by_tracking_id(&rec.tracking_id).await.unwrap().unwrap();
        assert_eq!(got.status, TrackingStatus::Ringing);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_engagement_counters() {
        let db = SqliteBackend::open_in_memory().unwrap();
        let rec = TrackingRecord::new(TrackingChannel::Email, "a@b.co", Correlation::default());
        db.insert_tracking(&rec).await.unwrap();
        let t0 = Utc::now();
        db.record_engagement(&rec.tracking_id, EngagementKind::Open, t0).await.unwrap();
        db.record_engagement(&rec.tracking_id, EngagementKind::Open, t0 + chrono::Duration::minutes(1))
            .await
            .unwrap();
        db.record_engagement(&rec.tracking_id, EngagementKind::Click, t0).await.unwrap();
        assert!(!db.record_engagement("email-x", EngagementKind::Open, t0).await.unwrap());

        let got = db.find_by_tracking_id(&rec.tracking_id).await.unwrap().unwrap();
        assert_eq!(got.open_count, 2);
        assert_eq!(got.click_count, 1);
        assert_eq!(got.first_opened_at, Some(t0));
    }

    #[tokio::test]
    async fn test_artifacts_in_order() {
        let db = SqliteBackend::open_in_memory().unwrap();
        let mut a = ConversationArtifact::new("call-1");
        a.transcript = Some("AI: Hi".into());
        a.messages = Some(serde_json::json!([{"role": "assistant", "message": "Hi"}]));
        db.insert_artifact(&a).await.unwrap();
        let mut b = ConversationArtifact::new("call-1");
        b.created_at = a.created_at + chrono::Duration::seconds(5);
        b.recording_url = Some("https://rec/1.wav".into());
        db.insert_artifact(&b).await.unwrap();

        let got = db.artifacts("call-1").await.unwrap();
        assert_eq!(got, vec![a, b]);
        assert!(db.artifacts("call-2").await.unwrap().is_empty());
    }
}

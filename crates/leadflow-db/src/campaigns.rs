//! Campaign definitions and enrollment state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadflow_core::error::{LeadflowError, Result};
use leadflow_core::traits::CampaignRepository;
use leadflow_core::types::{Campaign, Enrollment, EnrollmentStatus, Lead, Step, StepType};
use rusqlite::{OptionalExtension, Row, params};

use crate::{SqliteBackend, db_err, parse_ts, ts};

const ENROLLMENT_COLUMNS: &str = "id, lead_id, campaign_id, current_step_index, status, \
     next_due_at, decision_path_id, paused_at, last_error, created_at, updated_at";

fn enrollment_from_row(row: &Row<'_>) -> rusqlite::Result<Enrollment> {
    let status: String = row.get(4)?;
    let created: String = row.get(9)?;
    let updated: String = row.get(10)?;
    let opt_ts = |s: Option<String>| s.as_deref().and_then(parse_ts);
    Ok(Enrollment {
        id: row.get(0)?,
        lead_id: row.get(1)?,
        campaign_id: row.get(2)?,
        current_step_index: row.get::<_, i64>(3)?.max(0) as usize,
        status: EnrollmentStatus::parse(&status).unwrap_or(EnrollmentStatus::Pending),
        next_due_at: opt_ts(row.get(5)?),
        decision_path_id: row.get(6)?,
        paused_at: opt_ts(row.get(7)?),
        last_error: row.get(8)?,
        created_at: parse_ts(&created).unwrap_or_else(Utc::now),
        updated_at: parse_ts(&updated).unwrap_or_else(Utc::now),
    })
}

impl SqliteBackend {
    fn query_enrollments(
        &self,
        filter: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Enrollment>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE {filter}");
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params, enrollment_from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(rows)
    }
}

#[async_trait]
impl CampaignRepository for SqliteBackend {
    async fn enabled_campaigns(&self) -> Result<Vec<Campaign>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id, name, enabled FROM campaigns WHERE enabled = 1 ORDER BY id")
            .map_err(db_err)?;
        let campaigns = stmt
            .query_map([], |row| {
                Ok(Campaign {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    enabled: row.get(2)?,
                })
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(campaigns)
    }

    async fn steps(&self, campaign_id: &str) -> Result<Vec<Step>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, campaign_id, step_type, order_index, config FROM steps
                 WHERE campaign_id = ?1 ORDER BY order_index",
            )
            .map_err(db_err)?;
        let raw = stmt
            .query_map(params![campaign_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;

        let mut steps = Vec::with_capacity(raw.len());
        for (id, campaign_id, step_type, order_index, config) in raw {
            // Enrollments index steps by position, so a hole would shift every later step.
            let step_type = StepType::parse(&step_type).ok_or_else(|| {
                LeadflowError::Backend(format!("Step {id} has unknown type '{step_type}'"))
            })?;
            let config = serde_json::from_str(&config).map_err(|e| {
                LeadflowError::Backend(format!("Step {id} has malformed config: {e}"))
            })?;
            steps.push(Step {
                id,
                campaign_id,
                step_type,
                order_index: order_index.max(0) as usize,
                config,
            });
        }
        Ok(steps)
    }

    async fn due_enrollments(
        &self,
        campaign_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Enrollment>> {
        self.query_enrollments(
            "campaign_id = ?1 AND status IN ('pending', 'in_progress')
             AND paused_at IS NULL AND next_due_at IS NOT NULL AND next_due_at <= ?2
             ORDER BY next_due_at",
            &[&campaign_id, &ts(now)],
        )
    }

    async fn lead(&self, lead_id: &str) -> Result<Option<Lead>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, first_name, last_name, email, phone, company, title, custom
                 FROM leads WHERE id = ?1",
                params![lead_id],
                |row| {
                    Ok((
                        Lead {
                            id: row.get(0)?,
                            first_name: row.get(1)?,
                            last_name: row.get(2)?,
                            email: row.get(3)?,
                            phone: row.get(4)?,
                            company: row.get(5)?,
                            title: row.get(6)?,
                            custom: Default::default(),
                        },
                        row.get::<_, String>(7)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;
        Ok(row.map(|(mut lead, custom)| {
            lead.custom = serde_json::from_str(&custom).unwrap_or_default();
            lead
        }))
    }

    async fn enrollment(&self, enrollment_id: &str) -> Result<Option<Enrollment>> {
        Ok(self
            .query_enrollments("id = ?1", &[&enrollment_id])?
            .into_iter()
            .next())
    }

    async fn create_enrollment(&self, e: &Enrollment) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO enrollments ({ENROLLMENT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                e.id,
                e.lead_id,
                e.campaign_id,
                e.current_step_index as i64,
                e.status.as_str(),
                e.next_due_at.map(ts),
                e.decision_path_id,
                e.paused_at.map(ts),
                e.last_error,
                ts(e.created_at),
                ts(e.updated_at),
            ],
        )
        .map_err(|err| {
            let duplicate = matches!(
                &err,
                rusqlite::Error::SqliteFailure(f, _)
                    if f.code == rusqlite::ErrorCode::ConstraintViolation
            );
            if duplicate {
                LeadflowError::Validation(format!(
                    "lead {} is already enrolled in campaign {}",
                    e.lead_id, e.campaign_id
                ))
            } else {
                db_err(err)
            }
        })?;
        Ok(())
    }

    async fn save_enrollment(&self, e: &Enrollment) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE enrollments SET current_step_index = ?2, status = ?3, next_due_at = ?4,
                    decision_path_id = ?5, paused_at = ?6, last_error = ?7, updated_at = ?8
                 WHERE id = ?1",
                params![
                    e.id,
                    e.current_step_index as i64,
                    e.status.as_str(),
                    e.next_due_at.map(ts),
                    e.decision_path_id,
                    e.paused_at.map(ts),
                    e.last_error,
                    ts(e.updated_at),
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(LeadflowError::NotFound(format!("enrollment {}", e.id)));
        }
        Ok(())
    }

    async fn failed_enrollments(&self) -> Result<Vec<Enrollment>> {
        self.query_enrollments("status = 'failed' ORDER BY updated_at DESC", &[])
    }
}

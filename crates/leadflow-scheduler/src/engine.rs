//! Sequence Scheduler: the periodic pass over due enrollments.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use leadflow_channels::{CallDispatcher, CallOutcome, EmailDispatcher};
use leadflow_core::config::SchedulerConfig;
use leadflow_core::error::{LeadflowError, Result};
use leadflow_core::retry::{RetryPolicy, with_retry};
use leadflow_core::template::Placeholders;
use leadflow_core::tracking::TrackingStore;
use leadflow_core::traits::CampaignRepository;
use leadflow_core::types::{
    Campaign, Correlation, Enrollment, EnrollmentStatus, Lead, Step, StepType,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::progression::{Advance, apply_failure, apply_success, next_step};

/// Counters for one pass.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TickReport {
    /// Another pass was still running; nothing was done.
    pub overlapped: bool,
    pub campaigns: usize,
    pub due: usize,
    pub advanced: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub degraded_calls: usize,
    pub replayed_patches: usize,
}

impl TickReport {
    pub fn overlapped() -> Self {
        Self { overlapped: true, ..Self::default() }
    }
}

pub struct SequenceScheduler {
    repo: Arc<dyn CampaignRepository>,
    store: Arc<TrackingStore>,
    email: EmailDispatcher,
    calls: CallDispatcher,
    config: SchedulerConfig,
    retry: RetryPolicy,
    running: Mutex<()>,
}

impl SequenceScheduler {
    pub fn new(
        repo: Arc<dyn CampaignRepository>,
        store: Arc<TrackingStore>,
        email: EmailDispatcher,
        calls: CallDispatcher,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            repo,
            store,
            email,
            calls,
            config,
            retry: RetryPolicy::backend(),
            running: Mutex::new(()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn tick(&self) -> TickReport {
        self.tick_at(Utc::now()).await
    }

    /// One pass with a fixed clock. At most one pass runs at a time; an
    /// overlapping call returns [`TickReport::overlapped`] immediately.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let Ok(_running) = self.running.try_lock() else {
            tracing::warn!("⏭️ Scheduler pass still running, skipping this tick");
            return TickReport::overlapped();
        };

        let mut report = TickReport {
            replayed_patches: self.store.replay_deferred().await,
            ..TickReport::default()
        };

        let repo = &self.repo;
        let campaigns = match with_retry("load campaigns", self.retry, || async move {
            repo.enabled_campaigns().await
        })
        .await
        {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("⚠️ Could not load campaigns: {e}");
                return report;
            }
        };

        for campaign in &campaigns {
            report.campaigns += 1;
            if let Err(e) = self.run_campaign(campaign, now, &mut report).await {
                tracing::warn!("⚠️ Campaign '{}' ({}) aborted: {e}", campaign.name, campaign.id);
            }
        }

        if report.due > 0 {
            tracing::info!(
                "🔁 Pass done: {} due, {} advanced, {} completed, {} failed, {} skipped",
                report.due,
                report.advanced,
                report.completed,
                report.failed,
                report.skipped
            );
        } else {
            tracing::debug!("Pass done: nothing due across {} campaign(s)", report.campaigns);
        }
        report
    }

    async fn run_campaign(
        &self,
        campaign: &Campaign,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        let repo = &self.repo;
        let id = campaign.id.as_str();
        let steps = with_retry("load steps", self.retry, || async move { repo.steps(id).await })
            .await?;
        let due = with_retry("load enrollments", self.retry, || async move {
            repo.due_enrollments(id, now).await
        })
        .await?;

        for enrollment in due {
            report.due += 1;
            let enrollment_id = enrollment.id.clone();
            if let Err(e) = self.process(campaign, &steps, enrollment, now, report).await {
                tracing::warn!("⚠️ Enrollment {enrollment_id} not saved: {e}");
            }
        }
        Ok(())
    }

    /// Execute the current step of one enrollment and persist the outcome.
    /// Only a failed save surfaces as an error.
    async fn process(
        &self,
        campaign: &Campaign,
        steps: &[Step],
        mut enrollment: Enrollment,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        let Some(step) = steps.get(enrollment.current_step_index) else {
            tracing::warn!(
                "Enrollment {} points at step {} but campaign {} has {} step(s), skipping",
                enrollment.id,
                enrollment.current_step_index,
                campaign.id,
                steps.len()
            );
            report.skipped += 1;
            return Ok(());
        };

        match self.execute(step, &enrollment, report).await {
            Ok(()) => {
                let advance = next_step(
                    step,
                    enrollment.current_step_index,
                    enrollment.decision_path_id.as_deref(),
                    &self.config.terminal_path_label,
                    steps.len(),
                );
                apply_success(&mut enrollment, step, &advance, now);
                match advance {
                    Advance::Step(index) => {
                        tracing::debug!("Enrollment {} → step {index}", enrollment.id);
                        report.advanced += 1;
                    }
                    Advance::Complete => {
                        tracing::info!("🏁 Enrollment {} completed", enrollment.id);
                        report.completed += 1;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    "❌ Enrollment {} failed at step {} ({}): {e}",
                    enrollment.id,
                    enrollment.current_step_index,
                    step.step_type.as_str()
                );
                apply_failure(&mut enrollment, &e.to_string(), now);
                report.failed += 1;
            }
        }

        let repo = &self.repo;
        let e = &enrollment;
        with_retry("save enrollment", self.retry, || async move { repo.save_enrollment(e).await })
            .await
    }

    async fn execute(&self, step: &Step, enrollment: &Enrollment, report: &mut TickReport) -> Result<()> {
        let correlation = Correlation {
            enrollment_id: Some(enrollment.id.clone()),
            step_id: Some(step.id.clone()),
            lead_id: Some(enrollment.lead_id.clone()),
            campaign_id: Some(enrollment.campaign_id.clone()),
        };

        match step.step_type {
            StepType::Manual => {
                tracing::debug!("Manual step {} for {}, nothing to dispatch", step.id, enrollment.id);
                Ok(())
            }
            StepType::Email => {
                let lead = self.load_lead(&enrollment.lead_id).await?;
                let to = lead.email.as_deref().filter(|e| !e.trim().is_empty()).ok_or_else(|| {
                    LeadflowError::Validation(format!("lead {} has no email address", lead.id))
                })?;
                let body = step.config.message_template.as_deref().ok_or_else(|| {
                    LeadflowError::Validation(format!("email step {} has no message", step.id))
                })?;
                let subject = step.config.subject.as_deref().unwrap_or_default();
                self.email
                    .send_email(to, subject, body, &Placeholders::for_lead(&lead), correlation)
                    .await?;
                Ok(())
            }
            StepType::Call => {
                let lead = self.load_lead(&enrollment.lead_id).await?;
                let phone = lead.phone.as_deref().filter(|p| !p.trim().is_empty()).ok_or_else(|| {
                    LeadflowError::Validation(format!("lead {} has no phone number", lead.id))
                })?;
                let script = step.config.script.as_ref().ok_or_else(|| {
                    LeadflowError::Validation(format!("call step {} has no script", step.id))
                })?;
                match self.calls.place_call(phone, &lead, script, correlation).await? {
                    CallOutcome::Dispatched(_) => Ok(()),
                    CallOutcome::Degraded { result, reason } => {
                        report.degraded_calls += 1;
                        if self.config.advance_on_degraded_call {
                            tracing::warn!(
                                "Call {} only queued locally, advancing anyway",
                                result.tracking_id
                            );
                            Ok(())
                        } else {
                            Err(LeadflowError::Provider(format!(
                                "call {} not placed: {reason}",
                                result.tracking_id
                            )))
                        }
                    }
                }
            }
        }
    }

    async fn load_lead(&self, lead_id: &str) -> Result<Lead> {
        let repo = &self.repo;
        with_retry("load lead", self.retry, || async move { repo.lead(lead_id).await })
            .await?
            .ok_or_else(|| LeadflowError::Validation(format!("lead {lead_id} not found")))
    }

    /// Enroll a lead: `pending`, due immediately.
    pub async fn enroll(&self, lead_id: &str, campaign_id: &str) -> Result<Enrollment> {
        if self.repo.lead(lead_id).await?.is_none() {
            return Err(LeadflowError::NotFound(format!("lead {lead_id}")));
        }
        if self.repo.steps(campaign_id).await?.is_empty() {
            return Err(LeadflowError::Validation(format!(
                "campaign {campaign_id} has no steps"
            )));
        }
        let enrollment = Enrollment::new(lead_id, campaign_id, Utc::now());
        self.repo.create_enrollment(&enrollment).await?;
        tracing::info!("➕ Enrolled lead {lead_id} in campaign {campaign_id} ({})", enrollment.id);
        Ok(enrollment)
    }

    /// Put a failed enrollment back in the queue at the step it failed on.
    pub async fn reset_enrollment(&self, enrollment_id: &str) -> Result<Enrollment> {
        let mut enrollment = self
            .repo
            .enrollment(enrollment_id)
            .await?
            .ok_or_else(|| LeadflowError::NotFound(format!("enrollment {enrollment_id}")))?;
        if enrollment.status != EnrollmentStatus::Failed {
            return Err(LeadflowError::Validation(format!(
                "enrollment {enrollment_id} is {}, only failed enrollments can be reset",
                enrollment.status.as_str()
            )));
        }
        let now = Utc::now();
        enrollment.status = EnrollmentStatus::Pending;
        enrollment.next_due_at = Some(now);
        enrollment.last_error = None;
        enrollment.updated_at = now;
        self.repo.save_enrollment(&enrollment).await?;
        tracing::info!("♻️ Enrollment {enrollment_id} reset at step {}", enrollment.current_step_index);
        Ok(enrollment)
    }

    pub async fn failed_enrollments(&self) -> Result<Vec<Enrollment>> {
        self.repo.failed_enrollments().await
    }
}

/// Run the eager first pass, then one pass per interval. Ticks missed while
/// a pass was running are skipped, not replayed.
pub fn spawn_scheduler(scheduler: Arc<SequenceScheduler>, every: Duration) -> JoinHandle<()> {
    tracing::info!("⏰ Scheduler started (every {}s)", every.as_secs());
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            scheduler.tick().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use leadflow_core::cache::CallRegistry;
    use leadflow_core::traits::{
        CallRequest, Mailer, OutboundEmail, ProviderCall, VoiceProvider,
    };
    use leadflow_core::types::{
        CallScript, DecisionPath, PathTarget, StepConfig, TrackingStatus, WaitTime, WaitUnit,
    };
    use leadflow_db::SqliteBackend;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeMailer {
        down: AtomicBool,
        sent: AtomicUsize,
    }

    #[async_trait]
    impl Mailer for FakeMailer {
        async fn send(&self, _email: &OutboundEmail) -> Result<Option<String>> {
            if self.down.load(Ordering::SeqCst) {
                return Err(LeadflowError::Channel("SMTP send: connection refused".into()));
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    #[derive(Default)]
    struct FakeVoice {
        down: AtomicBool,
    }

    #[async_trait]
    impl VoiceProvider for FakeVoice {
        fn name(&self) -> &str {
            "fake"
        }

        async fn place_call(&self, _request: &CallRequest) -> Result<ProviderCall> {
            if self.down.load(Ordering::SeqCst) {
                return Err(LeadflowError::Provider("connection refused".into()));
            }
            Ok(ProviderCall { id: "vapi-1".into(), status: "queued".into() })
        }
    }

    /// Delegates to SQLite but cannot load the steps of one campaign.
    struct BrokenSteps {
        inner: Arc<SqliteBackend>,
        broken: &'static str,
    }

    #[async_trait]
    impl CampaignRepository for BrokenSteps {
        async fn enabled_campaigns(&self) -> Result<Vec<Campaign>> {
            self.inner.enabled_campaigns().await
        }

        async fn steps(&self, campaign_id: &str) -> Result<Vec<Step>> {
            if campaign_id == self.broken {
                return Err(LeadflowError::Backend("malformed step config".into()));
            }
            self.inner.steps(campaign_id).await
        }

        async fn due_enrollments(
            &self,
            campaign_id: &str,
            now: DateTime<Utc>,
        ) -> Result<Vec<Enrollment>> {
            self.inner.due_enrollments(campaign_id, now).await
        }

        async fn lead(&self, lead_id: &str) -> Result<Option<Lead>> {
            self.inner.lead(lead_id).await
        }

        async fn enrollment(&self, enrollment_id: &str) -> Result<Option<Enrollment>> {
            self.inner.enrollment(enrollment_id).await
        }

        async fn create_enrollment(&self, enrollment: &Enrollment) -> Result<()> {
            self.inner.create_enrollment(enrollment).await
        }

        async fn save_enrollment(&self, enrollment: &Enrollment) -> Result<()> {
            self.inner.save_enrollment(enrollment).await
        }

        async fn failed_enrollments(&self) -> Result<Vec<Enrollment>> {
            self.inner.failed_enrollments().await
        }
    }

    struct Harness {
        db: Arc<SqliteBackend>,
        mailer: Arc<FakeMailer>,
        voice: Arc<FakeVoice>,
        store: Arc<TrackingStore>,
    }

    impl Harness {
        fn new() -> Self {
            let db = Arc::new(SqliteBackend::open_in_memory().unwrap());
            let store = Arc::new(TrackingStore::new(
                db.clone(),
                RetryPolicy::immediate(1),
                Duration::from_secs(60),
                100,
            ));
            db.upsert_campaign(&Campaign { id: "c1".into(), name: "Outreach".into(), enabled: true })
                .unwrap();
            db.upsert_lead(&Lead {
                id: "l1".into(),
                first_name: Some("Ada".into()),
                email: Some("ada@example.com".into()),
                phone: Some("5550001111".into()),
                ..Default::default()
            })
            .unwrap();
            Self {
                db,
                mailer: Arc::new(FakeMailer::default()),
                voice: Arc::new(FakeVoice::default()),
                store,
            }
        }

        fn scheduler(&self, config: SchedulerConfig) -> SequenceScheduler {
            self.scheduler_over(self.db.clone(), config)
        }

        fn scheduler_over(
            &self,
            repo: Arc<dyn CampaignRepository>,
            config: SchedulerConfig,
        ) -> SequenceScheduler {
            let email = EmailDispatcher::new(self.mailer.clone(), self.store.clone(), "http://t")
                .with_retry_policy(RetryPolicy::immediate(1));
            let calls = CallDispatcher::new(
                self.voice.clone(),
                self.store.clone(),
                Arc::new(CallRegistry::default()),
                "http://t",
                "1",
            )
            .with_retry_policy(RetryPolicy::immediate(1));
            SequenceScheduler::new(repo, self.store.clone(), email, calls, config)
                .with_retry_policy(RetryPolicy::immediate(1))
        }

        fn step(&self, index: usize, step_type: StepType, config: StepConfig) {
            self.db
                .upsert_step(&Step {
                    id: format!("s{index}"),
                    campaign_id: "c1".into(),
                    step_type,
                    order_index: index,
                    config,
                })
                .unwrap();
        }

        async fn enrollment(&self, id: &str) -> Enrollment {
            self.db.enrollment(id).await.unwrap().unwrap()
        }
    }

    fn email_config(wait: WaitTime) -> StepConfig {
        StepConfig {
            wait,
            subject: Some("Hi {{firstName}}".into()),
            message_template: Some("Hello {{firstName}}".into()),
            ..Default::default()
        }
    }

    fn manual(wait: WaitTime) -> StepConfig {
        StepConfig { wait, ..Default::default() }
    }

    fn call_config() -> StepConfig {
        StepConfig {
            wait: WaitTime::new(1, WaitUnit::Days),
            script: Some(CallScript {
                greeting: "Hi {{firstName}}".into(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_email_step_advances_and_waits() {
        let h = Harness::new();
        h.step(0, StepType::Email, email_config(WaitTime::new(1, WaitUnit::Days)));
        h.step(1, StepType::Manual, manual(WaitTime::default()));
        let s = h.scheduler(SchedulerConfig::default());
        let e = s.enroll("l1", "c1").await.unwrap();

        let now = Utc::now();
        let report = s.tick_at(now).await;
        assert_eq!(report.due, 1);
        assert_eq!(report.advanced, 1);
        assert_eq!(h.mailer.sent.load(Ordering::SeqCst), 1);

        let got = h.enrollment(&e.id).await;
        assert_eq!(got.status, EnrollmentStatus::InProgress);
        assert_eq!(got.current_step_index, 1);
        let due = got.next_due_at.unwrap();
        assert!((due - (now + ChronoDuration::days(1))).num_milliseconds().abs() <= 1);

        let report = s.tick_at(now + ChronoDuration::hours(1)).await;
        assert_eq!(report.due, 0);
        assert_eq!(h.mailer.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_linear_run_to_completion() {
        let h = Harness::new();
        for i in 0..3 {
            h.step(i, StepType::Manual, manual(WaitTime::new(30, WaitUnit::Minutes)));
        }
        let s = h.scheduler(SchedulerConfig::default());
        let e = s.enroll("l1", "c1").await.unwrap();

        let mut clock = Utc::now();
        for expected in 1..=2 {
            s.tick_at(clock).await;
            let got = h.enrollment(&e.id).await;
            assert_eq!(got.current_step_index, expected);
            assert_eq!(got.status, EnrollmentStatus::InProgress);
            clock += ChronoDuration::minutes(30);
        }
        let report = s.tick_at(clock).await;
        assert_eq!(report.completed, 1);
        let got = h.enrollment(&e.id).await;
        assert_eq!(got.status, EnrollmentStatus::Completed);
        assert_eq!(got.next_due_at, None);
        assert_eq!(got.current_step_index, 2);

        let report = s.tick_at(clock + ChronoDuration::days(30)).await;
        assert_eq!(report.due, 0);
    }

    #[tokio::test]
    async fn test_decision_paths() {
        let h = Harness::new();
        let paths = vec![
            DecisionPath { id: "replied".into(), label: "Replied".into(), target: Some(PathTarget::Step(2)) },
            DecisionPath { id: "done".into(), label: "End Sequence".into(), target: Some(PathTarget::Step(1)) },
            DecisionPath { id: "null".into(), label: "No Reply".into(), target: None },
        ];
        h.step(0, StepType::Manual, StepConfig { paths, ..Default::default() });
        h.step(1, StepType::Manual, manual(WaitTime::default()));
        h.step(2, StepType::Manual, manual(WaitTime::default()));
        h.db.upsert_lead(&Lead { id: "l2".into(), ..Default::default() }).unwrap();
        h.db.upsert_lead(&Lead { id: "l3".into(), ..Default::default() }).unwrap();
        h.db.upsert_lead(&Lead { id: "l4".into(), ..Default::default() }).unwrap();
        let s = h.scheduler(SchedulerConfig::default());

        let mut ids = Vec::new();
        for (lead, path) in [("l1", "replied"), ("l2", "done"), ("l3", "null"), ("l4", "unknown")] {
            let mut e = s.enroll(lead, "c1").await.unwrap();
            e.decision_path_id = Some(path.into());
            h.db.save_enrollment(&e).await.unwrap();
            ids.push(e.id);
        }

        s.tick_at(Utc::now()).await;
        let replied = h.enrollment(&ids[0]).await;
        assert_eq!((replied.current_step_index, replied.status), (2, EnrollmentStatus::InProgress));
        assert_eq!(replied.decision_path_id, None);
        assert_eq!(h.enrollment(&ids[1]).await.status, EnrollmentStatus::Completed);
        assert_eq!(h.enrollment(&ids[2]).await.status, EnrollmentStatus::Completed);
        let unknown = h.enrollment(&ids[3]).await;
        assert_eq!((unknown.current_step_index, unknown.status), (1, EnrollmentStatus::InProgress));
    }

    #[tokio::test]
    async fn test_email_failure_marks_failed_until_reset() {
        let h = Harness::new();
        h.step(0, StepType::Email, email_config(WaitTime::default()));
        h.step(1, StepType::Manual, manual(WaitTime::default()));
        h.mailer.down.store(true, Ordering::SeqCst);
        let s = h.scheduler(SchedulerConfig::default());
        let e = s.enroll("l1", "c1").await.unwrap();
        let due_before = h.enrollment(&e.id).await.next_due_at;

        let report = s.tick_at(Utc::now()).await;
        assert_eq!(report.failed, 1);
        let got = h.enrollment(&e.id).await;
        assert_eq!(got.status, EnrollmentStatus::Failed);
        assert_eq!(got.current_step_index, 0);
        assert_eq!(got.next_due_at, due_before);
        assert!(got.last_error.as_deref().unwrap().contains("connection refused"));

        assert_eq!(s.tick_at(Utc::now()).await.due, 0);
        assert_eq!(s.failed_enrollments().await.unwrap().len(), 1);

        h.mailer.down.store(false, Ordering::SeqCst);
        let reset = s.reset_enrollment(&e.id).await.unwrap();
        assert_eq!(reset.status, EnrollmentStatus::Pending);
        assert_eq!(reset.current_step_index, 0);
        assert_eq!(reset.last_error, None);

        let report = s.tick_at(Utc::now()).await;
        assert_eq!(report.advanced, 1);
        assert!(s.failed_enrollments().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reset_rejects_active_enrollment() {
        let h = Harness::new();
        h.step(0, StepType::Manual, manual(WaitTime::default()));
        let s = h.scheduler(SchedulerConfig::default());
        let e = s.enroll("l1", "c1").await.unwrap();
        assert!(s.reset_enrollment(&e.id).await.unwrap_err().is_validation());
        assert!(matches!(
            s.reset_enrollment("enr-missing").await.unwrap_err(),
            LeadflowError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_degraded_call_advances_by_default() {
        let h = Harness::new();
        h.step(0, StepType::Call, call_config());
        h.step(1, StepType::Manual, manual(WaitTime::default()));
        h.voice.down.store(true, Ordering::SeqCst);
        let s = h.scheduler(SchedulerConfig::default());
        let e = s.enroll("l1", "c1").await.unwrap();

        let report = s.tick_at(Utc::now()).await;
        assert_eq!(report.degraded_calls, 1);
        assert_eq!(report.advanced, 1);
        let got = h.enrollment(&e.id).await;
        assert_eq!(got.current_step_index, 1);
        assert_eq!(got.status, EnrollmentStatus::InProgress);
    }

    #[tokio::test]
    async fn test_degraded_call_can_fail_enrollment() {
        let h = Harness::new();
        h.step(0, StepType::Call, call_config());
        h.voice.down.store(true, Ordering::SeqCst);
        let config = SchedulerConfig { advance_on_degraded_call: false, ..Default::default() };
        let s = h.scheduler(config);
        let e = s.enroll("l1", "c1").await.unwrap();

        let report = s.tick_at(Utc::now()).await;
        assert_eq!(report.failed, 1);
        let got = h.enrollment(&e.id).await;
        assert_eq!(got.status, EnrollmentStatus::Failed);
        assert!(got.last_error.unwrap().contains("not placed"));
    }

    #[tokio::test]
    async fn test_call_step_is_tracked() {
        let h = Harness::new();
        h.step(0, StepType::Call, call_config());
        let s = h.scheduler(SchedulerConfig::default());
        s.enroll("l1", "c1").await.unwrap();
        s.tick_at(Utc::now()).await;

        let rec = h.store.find_by_external_id("vapi-1").await.unwrap().unwrap();
        assert_eq!(rec.status, TrackingStatus::Queued);
        assert_eq!(rec.target, "+15550001111");
        assert_eq!(rec.correlation.step_id.as_deref(), Some("s0"));
    }

    #[tokio::test]
    async fn test_one_failure_does_not_stop_the_batch() {
        let h = Harness::new();
        h.step(0, StepType::Email, email_config(WaitTime::default()));
        h.db.upsert_lead(&Lead { id: "no-email".into(), ..Default::default() }).unwrap();
        let s = h.scheduler(SchedulerConfig::default());
        let bad = s.enroll("no-email", "c1").await.unwrap();
        let good = s.enroll("l1", "c1").await.unwrap();

        let report = s.tick_at(Utc::now()).await;
        assert_eq!(report.due, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.completed, 1);
        let bad = h.enrollment(&bad.id).await;
        assert!(bad.last_error.unwrap().contains("no email"));
        assert_eq!(h.enrollment(&good.id).await.status, EnrollmentStatus::Completed);
    }

    #[tokio::test]
    async fn test_broken_campaign_does_not_stop_the_others() {
        let h = Harness::new();
        h.db.upsert_campaign(&Campaign { id: "c0".into(), name: "Broken".into(), enabled: true })
            .unwrap();
        h.step(0, StepType::Manual, manual(WaitTime::default()));
        h.step(1, StepType::Manual, manual(WaitTime::default()));
        let s = h.scheduler_over(
            Arc::new(BrokenSteps { inner: h.db.clone(), broken: "c0" }),
            SchedulerConfig::default(),
        );
        let good = s.enroll("l1", "c1").await.unwrap();
        let stuck = Enrollment::new("l1", "c0", Utc::now());
        h.db.create_enrollment(&stuck).await.unwrap();

        let report = s.tick_at(Utc::now()).await;
        assert_eq!(report.campaigns, 2);
        assert_eq!(report.advanced, 1);
        let good = h.enrollment(&good.id).await;
        assert_eq!((good.current_step_index, good.status), (1, EnrollmentStatus::InProgress));
        let stuck = h.enrollment(&stuck.id).await;
        assert_eq!((stuck.current_step_index, stuck.status), (0, EnrollmentStatus::Pending));
    }

    #[tokio::test]
    async fn test_out_of_range_step_is_skipped() {
        let h = Harness::new();
        h.step(0, StepType::Manual, manual(WaitTime::default()));
        let s = h.scheduler(SchedulerConfig::default());
        let mut e = s.enroll("l1", "c1").await.unwrap();
        e.current_step_index = 7;
        h.db.save_enrollment(&e).await.unwrap();

        let report = s.tick_at(Utc::now()).await;
        assert_eq!(report.skipped, 1);
        let got = h.enrollment(&e.id).await;
        assert_eq!(got.status, EnrollmentStatus::Pending);
        assert_eq!(got.current_step_index, 7);
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_refused() {
        let h = Harness::new();
        let s = h.scheduler(SchedulerConfig::default());
        let held = s.running.try_lock().unwrap();
        assert_eq!(s.tick().await, TickReport::overlapped());
        drop(held);
        assert!(!s.tick().await.overlapped);
    }

    #[tokio::test]
    async fn test_enroll_validation() {
        let h = Harness::new();
        let s = h.scheduler(SchedulerConfig::default());
        assert!(s.enroll("l1", "c1").await.unwrap_err().is_validation());
        h.step(0, StepType::Manual, manual(WaitTime::default()));
        assert!(matches!(
            s.enroll("ghost", "c1").await.unwrap_err(),
            LeadflowError::NotFound(_)
        ));
        s.enroll("l1", "c1").await.unwrap();
        assert!(s.enroll("l1", "c1").await.unwrap_err().is_validation());
    }
}

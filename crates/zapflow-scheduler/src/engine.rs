//! Dispatch engine — job commands plus the per-job dispatch loop.
//!
//! Each running job owns exactly one detached tokio task:
//! poll status → gates → send → record → sleep → poll again.
//! Cancellation is cooperative: `pause`/`stop` only flip the stored status,
//! and the loop notices at the top of its next iteration, so a pause can
//! land up to one delay late.
//!
//! A campaign's quota is checked before its next item is claimed, so a
//! campaign that spends the last slot on its last item pauses rather than
//! completes. Warming picks the sender per item, so its quota gate is the
//! reservation made after the item's target is resolved.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use zapflow_channels::MessageSender;
use zapflow_core::clock;
use zapflow_core::config::{DispatchConfig, StartupPolicy};
use zapflow_core::error::{Result, ZapflowError};

use crate::job::{
    DispatchJob, DispatchLogEntry, JobKind, JobStatus, LogEvent, NewInstance, NewItem, NewJob,
    PacingConfig, SendingInstance, WorkItem,
};
use crate::pacing::PacingPolicy;
use crate::persistence::{DispatchDb, ItemCounts};
use crate::queue::{AttachOutcome, Outcome, Resolution, WorkQueue};
use crate::target::{ResolveError, TargetResolver, plan_warming_pairs};

/// Upper bound on the items one `plan_warming` call may attach.
pub const MAX_PLANNED_ITEMS: u64 = 10_000;

/// Loop-wide settings derived from `[dispatch]`.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub country_code: String,
    pub tz: Tz,
    pub recent_log_limit: usize,
    pub default_pacing: PacingConfig,
    pub startup_policy: StartupPolicy,
    /// Wall clock; swapped out in tests.
    pub clock: fn() -> DateTime<Utc>,
}

impl EngineSettings {
    pub fn from_config(config: &DispatchConfig) -> Result<Self> {
        Ok(Self {
            country_code: config.default_country_code.clone(),
            tz: config.tz()?,
            recent_log_limit: config.recent_log_limit,
            default_pacing: PacingConfig::from_defaults(config),
            startup_policy: config.startup_policy,
            clock: Utc::now,
        })
    }
}

/// Snapshot returned by `stats`.
#[derive(Debug, Clone, Serialize)]
pub struct JobStats {
    pub job: DispatchJob,
    pub items: ItemCounts,
    /// Newest first.
    pub logs: Vec<DispatchLogEntry>,
}

/// How one run of the loop ended.
enum LoopExit {
    /// The job left `running`; the loop may be revived if it was resumed meanwhile.
    Yielded,
    /// Storage failure or vanished job. Never revived.
    Aborted,
}

struct EngineInner {
    db: Arc<DispatchDb>,
    queue: WorkQueue,
    resolver: TargetResolver,
    sender: Arc<dyn MessageSender>,
    settings: EngineSettings,
    /// Jobs with a live loop. Spawn and exit decisions both happen under this lock.
    workers: Mutex<HashSet<String>>,
}

/// Cheap to clone; all clones share one store, sender, and worker registry.
#[derive(Clone)]
pub struct DispatchEngine {
    inner: Arc<EngineInner>,
}

impl DispatchEngine {
    pub fn new(db: Arc<DispatchDb>, sender: Arc<dyn MessageSender>, settings: EngineSettings) -> Self {
        let queue = WorkQueue::new(db.clone());
        let resolver = TargetResolver::new(db.clone(), settings.country_code.clone());
        Self {
            inner: Arc::new(EngineInner {
                db,
                queue,
                resolver,
                sender,
                settings,
                workers: Mutex::new(HashSet::new()),
            }),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.inner.settings.clock)()
    }

    fn workers(&self) -> Result<MutexGuard<'_, HashSet<String>>> {
        self.inner
            .workers
            .lock()
            .map_err(|e| ZapflowError::Storage(format!("Worker registry: {e}")))
    }

    /// Whether a dispatch loop is currently alive for the job.
    pub fn is_active(&self, job_id: &str) -> bool {
        self.workers().map(|w| w.contains(job_id)).unwrap_or(false)
    }

    fn log(&self, job_id: &str, item_id: Option<i64>, event: LogEvent, message: &str) -> Result<()> {
        self.inner.db.append_log(job_id, item_id, event, message)?;
        Ok(())
    }

    // ─── Instances ──────────────────────────────────────────

    pub fn register_instance(&self, req: NewInstance) -> Result<SendingInstance> {
        if req.name.trim().is_empty() || req.token.trim().is_empty() {
            return Err(ZapflowError::Validation("instance name and token are required".into()));
        }
        let instance = SendingInstance::register(req);
        let today = clock::local_date(self.now(), self.inner.settings.tz);
        self.inner.db.save_instance(&instance, today)?;
        tracing::info!("📱 Instance registered: '{}' ({})", instance.name, instance.id);
        Ok(instance)
    }

    pub fn list_instances(&self) -> Result<Vec<SendingInstance>> {
        self.inner.db.list_instances()
    }

    pub fn set_instance_connected(&self, id: &str, connected: bool) -> Result<SendingInstance> {
        if !self.inner.db.set_instance_connected(id, connected)? {
            return Err(ZapflowError::not_found("instance", id));
        }
        self.inner
            .db
            .get_instance(id)?
            .ok_or_else(|| ZapflowError::not_found("instance", id))
    }

    // ─── Jobs ───────────────────────────────────────────────

    pub fn create_job(&self, req: NewJob) -> Result<DispatchJob> {
        if req.name.trim().is_empty() {
            return Err(ZapflowError::Validation("job name is required".into()));
        }
        if let Some(p) = &req.pacing {
            if p.min_delay_secs > p.max_delay_secs {
                return Err(ZapflowError::Validation(format!(
                    "min_delay_secs ({}) exceeds max_delay_secs ({})",
                    p.min_delay_secs, p.max_delay_secs
                )));
            }
        }
        let job = DispatchJob::draft(req, &self.inner.settings.default_pacing);
        if job.kind == JobKind::Campaign {
            if let Some(instance_id) = job.instance_id.as_deref() {
                if self.inner.db.get_instance(instance_id)?.is_none() {
                    return Err(ZapflowError::not_found("instance", instance_id));
                }
            }
        }
        self.inner.db.insert_job(&job)?;
        self.log(&job.id, None, LogEvent::Created, &format!("Job '{}' created", job.name))?;
        tracing::info!("📋 Job created: '{}' [{}] ({})", job.name, job.kind.as_str(), job.id);
        Ok(job)
    }

    pub fn get_job(&self, id: &str) -> Result<DispatchJob> {
        self.inner
            .db
            .get_job(id)?
            .ok_or_else(|| ZapflowError::not_found("job", id))
    }

    pub fn list_jobs(&self) -> Result<Vec<DispatchJob>> {
        self.inner.db.list_jobs()
    }

    /// Attach work items. Each item's target must match the job kind.
    pub fn add_items(&self, job_id: &str, items: Vec<NewItem>) -> Result<AttachOutcome> {
        let job = self.get_job(job_id)?;
        if items.is_empty() {
            return Err(ZapflowError::Validation("no items given".into()));
        }
        if let Some((n, item)) = items
            .iter()
            .enumerate()
            .find(|(_, i)| i.target.kind() != job.kind)
        {
            return Err(ZapflowError::Validation(format!(
                "item {n} targets a {} job, but '{}' is a {} job",
                item.target.kind().as_str(),
                job.name,
                job.kind.as_str()
            )));
        }
        self.inner.queue.attach(job_id, &items)
    }

    /// Attach every ordered pair of connected instances, `rounds` times over.
    pub fn plan_warming(&self, job_id: &str, rounds: u32) -> Result<AttachOutcome> {
        let job = self.get_job(job_id)?;
        if job.kind != JobKind::Warming {
            return Err(ZapflowError::Validation(format!("job '{}' is not a warming job", job.name)));
        }
        let instances = self.inner.db.connected_instances()?;
        if instances.len() < 2 {
            return Err(ZapflowError::Validation(
                "warming needs at least 2 connected instances".into(),
            ));
        }
        let rounds = rounds.max(1);
        let n = instances.len() as u64;
        let planned = u64::from(rounds) * n * (n - 1);
        if planned > MAX_PLANNED_ITEMS {
            return Err(ZapflowError::Validation(format!(
                "{rounds} rounds over {n} instances would plan {planned} items, limit is {MAX_PLANNED_ITEMS}"
            )));
        }
        let items = plan_warming_pairs(&instances, rounds);
        self.add_items(job_id, items)
    }

    pub fn stats(&self, job_id: &str) -> Result<JobStats> {
        let job = self.get_job(job_id)?;
        let items = self.inner.db.item_counts(job_id)?;
        let logs = self
            .inner
            .db
            .recent_logs(job_id, self.inner.settings.recent_log_limit)?;
        Ok(JobStats { job, items, logs })
    }

    // ─── Lifecycle commands ─────────────────────────────────

    /// Reject a start/resume that could never send anything. A paused job
    /// with nothing left pending may still resume; its loop just completes.
    fn validate_startable(&self, job: &DispatchJob, resuming: bool) -> Result<()> {
        let counts = self.inner.db.item_counts(&job.id)?;
        if counts.pending == 0 {
            if resuming {
                return Ok(());
            }
            return Err(ZapflowError::Validation(format!("job '{}' has no pending items", job.name)));
        }
        match job.kind {
            JobKind::Campaign => {
                let Some(instance_id) = job.instance_id.as_deref() else {
                    return Err(ZapflowError::Validation("campaign has no sending instance".into()));
                };
                match self.inner.db.get_instance(instance_id)? {
                    Some(i) if i.connected => {}
                    Some(i) => {
                        return Err(ZapflowError::Validation(format!(
                            "instance '{}' is disconnected",
                            i.name
                        )));
                    }
                    None => return Err(ZapflowError::not_found("instance", instance_id)),
                }
                if job.message_template.trim().is_empty() {
                    return Err(ZapflowError::Validation("campaign message is empty".into()));
                }
            }
            JobKind::Warming => {
                let connected = self.inner.db.connected_instances()?.len();
                if connected < 2 {
                    return Err(ZapflowError::Validation(format!(
                        "warming needs at least 2 connected instances, found {connected}"
                    )));
                }
                if job.message_pool.is_empty() {
                    let carries_message = self
                        .inner
                        .queue
                        .next_pending(&job.id)?
                        .is_some_and(|i| i.variables.contains_key("message"));
                    if !carries_message {
                        return Err(ZapflowError::Validation(
                            "warming job has no message pool".into(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// `draft → running`, then spawn the loop. Returns as soon as the loop is launched.
    pub fn start(&self, job_id: &str) -> Result<DispatchJob> {
        let job = self.get_job(job_id)?;
        if job.status != JobStatus::Draft {
            return Err(ZapflowError::InvalidState(format!(
                "job '{}' is {}; only draft jobs can be started",
                job.name, job.status
            )));
        }
        self.validate_startable(&job, false)?;

        // The sending instance's hours travel with the job.
        if job.window.is_none() && job.kind == JobKind::Campaign {
            if let Some(instance) = job
                .instance_id
                .as_deref()
                .map(|id| self.inner.db.get_instance(id))
                .transpose()?
                .flatten()
            {
                if instance.window.is_some() {
                    self.inner.db.set_job_window(job_id, instance.window.as_ref())?;
                }
            }
        }

        self.launch(job_id, JobStatus::Draft, LogEvent::Started, "Dispatch started")?;
        tracing::info!("🚀 Dispatch started: '{}' ({})", job.name, job.id);
        self.get_job(job_id)
    }

    /// `paused → running`, spawning a loop unless one is still winding down.
    pub fn resume(&self, job_id: &str) -> Result<DispatchJob> {
        let job = self.get_job(job_id)?;
        if job.status != JobStatus::Paused {
            return Err(ZapflowError::InvalidState(format!(
                "job '{}' is {}; only paused jobs can be resumed",
                job.name, job.status
            )));
        }
        self.validate_startable(&job, true)?;
        self.launch(job_id, JobStatus::Paused, LogEvent::Resumed, "Dispatch resumed")?;
        tracing::info!("▶️ Dispatch resumed: '{}' ({})", job.name, job.id);
        self.get_job(job_id)
    }

    fn launch(&self, job_id: &str, from: JobStatus, event: LogEvent, message: &str) -> Result<()> {
        let mut workers = self.workers()?;
        if !self.inner.db.update_status(job_id, &[from], JobStatus::Running)? {
            return Err(ZapflowError::InvalidState(format!(
                "job {job_id} changed state concurrently"
            )));
        }
        self.log(job_id, None, event, message)?;
        self.spawn_locked(&mut workers, job_id);
        Ok(())
    }

    /// Must be called with the registry lock held.
    fn spawn_locked(&self, workers: &mut HashSet<String>, job_id: &str) {
        if !workers.insert(job_id.to_string()) {
            tracing::debug!("Loop for job {job_id} still alive, not spawning another");
            return;
        }
        let engine = self.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            engine.run_loop(job_id).await;
        });
    }

    /// `running → paused`. Takes effect at the loop's next iteration.
    pub fn pause(&self, job_id: &str) -> Result<DispatchJob> {
        let job = self.get_job(job_id)?;
        if !self.inner.db.update_status(job_id, &[JobStatus::Running], JobStatus::Paused)? {
            return Err(ZapflowError::InvalidState(format!(
                "job '{}' is {}; only running jobs can be paused",
                job.name, job.status
            )));
        }
        self.log(job_id, None, LogEvent::Paused, "Paused by operator")?;
        tracing::info!("⏸️ Dispatch paused: '{}' ({})", job.name, job.id);
        self.get_job(job_id)
    }

    /// `running|paused → failed`. Pending items are left as they are.
    pub fn stop(&self, job_id: &str) -> Result<DispatchJob> {
        let job = self.get_job(job_id)?;
        if !self.inner.db.update_status(
            job_id,
            &[JobStatus::Running, JobStatus::Paused],
            JobStatus::Failed,
        )? {
            return Err(ZapflowError::InvalidState(format!(
                "job '{}' is {}; only running or paused jobs can be stopped",
                job.name, job.status
            )));
        }
        let pending = self.inner.db.item_counts(job_id)?.pending;
        self.log(
            job_id,
            None,
            LogEvent::Stopped,
            &format!("Stopped by operator, {pending} items left pending"),
        )?;
        tracing::info!("⏹️ Dispatch stopped: '{}' ({})", job.name, job.id);
        self.get_job(job_id)
    }

    /// Handle jobs a previous process left `running`. Returns how many were found.
    pub fn reconcile_on_startup(&self) -> Result<usize> {
        let stale = self.inner.db.jobs_with_status(JobStatus::Running)?;
        for job in &stale {
            match self.inner.settings.startup_policy {
                StartupPolicy::Resume => {
                    let mut workers = self.workers()?;
                    self.log(&job.id, None, LogEvent::Resumed, "Resumed after restart")?;
                    self.spawn_locked(&mut workers, &job.id);
                    tracing::info!("🔄 Resumed interrupted job '{}' ({})", job.name, job.id);
                }
                StartupPolicy::Fail => {
                    self.inner
                        .db
                        .update_status(&job.id, &[JobStatus::Running], JobStatus::Failed)?;
                    self.log(&job.id, None, LogEvent::Error, "Interrupted by restart")?;
                    tracing::warn!("⚠️ Job '{}' ({}) interrupted by restart, marked failed", job.name, job.id);
                }
            }
        }
        Ok(stale.len())
    }

    // ─── Dispatch loop ──────────────────────────────────────

    async fn run_loop(self, job_id: String) {
        loop {
            let exit = self.run_until_yield(&job_id).await;
            let Ok(mut workers) = self.workers() else {
                return;
            };
            let revived = matches!(exit, LoopExit::Yielded)
                && matches!(
                    self.inner.db.get_job(&job_id),
                    Ok(Some(ref j)) if j.status == JobStatus::Running
                );
            if !revived {
                workers.remove(&job_id);
                tracing::debug!("Loop for job {job_id} ended");
                return;
            }
            tracing::debug!("Job {job_id} resumed while its loop was stopping, continuing");
        }
    }

    async fn run_until_yield(&self, job_id: &str) -> LoopExit {
        let mut sent_since_pause: u32 = 0;
        loop {
            match self.iterate(job_id, &mut sent_since_pause).await {
                Ok(Some(exit)) => return exit,
                Ok(None) => {}
                Err(e) => {
                    self.abort(job_id, &e);
                    return LoopExit::Aborted;
                }
            }
        }
    }

    /// One pass: status → window → quota → next item → reserve → send → record → sleep.
    /// `Some` ends the run.
    async fn iterate(&self, job_id: &str, sent_since_pause: &mut u32) -> Result<Option<LoopExit>> {
        let Some(job) = self.inner.db.get_job(job_id)? else {
            tracing::warn!("⚠️ Job {job_id} vanished, stopping its loop");
            return Ok(Some(LoopExit::Aborted));
        };
        if job.status != JobStatus::Running {
            return Ok(Some(LoopExit::Yielded));
        }

        let policy = PacingPolicy::new(job.pacing.clone(), job.window, self.inner.settings.tz);
        let now = self.now();

        if !policy.sending_allowed(now) {
            let window = policy.window().map(|w| w.to_string()).unwrap_or_default();
            self.halt(&job, LogEvent::AutoPaused, &format!("Outside business hours ({window})"))?;
            tracing::info!("🌙 '{}' paused outside business hours {window}", job.name);
            return Ok(Some(LoopExit::Yielded));
        }

        let today = policy.today(now);
        if job.kind == JobKind::Campaign {
            if let Some(instance_id) = job.instance_id.as_deref() {
                if let Some(quota) = self.inner.db.quota(instance_id, today)? {
                    if policy.quota_remaining(&quota, now) <= 0 {
                        let name = self
                            .inner
                            .db
                            .get_instance(instance_id)?
                            .map(|i| i.name)
                            .unwrap_or_else(|| instance_id.to_string());
                        self.pause_for_quota(&job, quota.daily_limit, &name)?;
                        return Ok(Some(LoopExit::Yielded));
                    }
                }
            }
        }

        let Some(item) = self.inner.queue.next_pending(job_id)? else {
            self.complete(&job)?;
            return Ok(Some(LoopExit::Yielded));
        };

        let send = match self.inner.resolver.resolve(&job, &item) {
            Ok(send) => send,
            Err(ResolveError::Unresolvable(reason)) => {
                // Nothing went out, so no pacing delay.
                self.record_failure(&job, &item, &reason)?;
                return Ok(None);
            }
            Err(ResolveError::Storage(e)) => return Err(e),
        };

        if !self.inner.db.try_reserve_quota(&send.instance.id, today)? {
            let limit = self
                .inner
                .db
                .quota(&send.instance.id, today)?
                .map(|q| q.daily_limit)
                .unwrap_or(0);
            self.pause_for_quota(&job, limit, &send.instance.name)?;
            return Ok(Some(LoopExit::Yielded));
        }

        let result = self
            .inner
            .sender
            .send_text(&send.instance.token, &send.recipient, &send.text)
            .await;

        match result {
            Ok(receipt) => {
                if let Resolution::Resolved(updated) =
                    self.inner.queue.mark_resolved(item.id, Outcome::Sent, None)?
                {
                    self.log(
                        job_id,
                        Some(item.id),
                        LogEvent::Sent,
                        &format!("Sent to {} via '{}'", send.recipient, send.instance.name),
                    )?;
                    tracing::debug!(
                        "📤 [{}] {} → {} ({}%) id={}",
                        job.name,
                        send.instance.name,
                        send.recipient,
                        updated.progress,
                        receipt.message_id.as_deref().unwrap_or("-")
                    );
                }
                *sent_since_pause += 1;
            }
            Err(e) => {
                self.inner.db.release_quota(&send.instance.id, today)?;
                let detail = format!("Failed to send to {}: {e}", send.recipient);
                self.record_failure(&job, &item, &detail)?;
            }
        }

        if policy.batch_pause_needed(*sent_since_pause) {
            let pause = policy.batch_pause_duration();
            self.log(
                job_id,
                None,
                LogEvent::BatchPause,
                &format!("Batch pause of {}s after {} sends", pause.as_secs(), *sent_since_pause),
            )?;
            tracing::info!("☕ '{}' batch pause {}s", job.name, pause.as_secs());
            tokio::time::sleep(pause).await;
            *sent_since_pause = 0;
        }

        tokio::time::sleep(policy.next_delay()).await;
        Ok(None)
    }

    fn record_failure(&self, job: &DispatchJob, item: &WorkItem, detail: &str) -> Result<()> {
        if let Resolution::Resolved(_) =
            self.inner
                .queue
                .mark_resolved(item.id, Outcome::Failed, Some(detail))?
        {
            self.log(&job.id, Some(item.id), LogEvent::Error, detail)?;
            tracing::warn!("⚠️ [{}] item {}: {detail}", job.name, item.id);
        }
        Ok(())
    }

    fn pause_for_quota(&self, job: &DispatchJob, limit: u32, instance: &str) -> Result<()> {
        self.halt(
            job,
            LogEvent::DailyLimit,
            &format!("Daily limit of {limit} reached for instance '{instance}'"),
        )?;
        tracing::info!("⛔ '{}' paused: daily limit reached on '{instance}'", job.name);
        Ok(())
    }

    /// Running → paused by the loop itself (window or quota).
    fn halt(&self, job: &DispatchJob, event: LogEvent, message: &str) -> Result<()> {
        if self
            .inner
            .db
            .update_status(&job.id, &[JobStatus::Running], JobStatus::Paused)?
        {
            self.log(&job.id, None, event, message)?;
        }
        Ok(())
    }

    fn complete(&self, job: &DispatchJob) -> Result<()> {
        if self
            .inner
            .db
            .update_status(&job.id, &[JobStatus::Running], JobStatus::Completed)?
        {
            let done = self.get_job(&job.id)?;
            self.log(
                &job.id,
                None,
                LogEvent::Completed,
                &format!("Completed: {} sent, {} failed", done.sent, done.failed),
            )?;
            tracing::info!(
                "✅ Dispatch completed: '{}' ({} sent, {} failed)",
                done.name,
                done.sent,
                done.failed
            );
        }
        Ok(())
    }

    /// Best effort: the store may be what failed.
    fn abort(&self, job_id: &str, err: &ZapflowError) {
        tracing::error!("❌ Dispatch loop for job {job_id} aborted: {err}");
        let _ = self
            .inner
            .db
            .update_status(job_id, &[JobStatus::Running, JobStatus::Paused], JobStatus::Failed);
        let _ = self.log(job_id, None, LogEvent::Error, &format!("Dispatch aborted: {err}"));
    }
}

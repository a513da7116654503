//! Dispatch data model: jobs, work items, sending instances, quotas, log.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use zapflow_core::config::DispatchConfig;

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Draft,
    Running,
    Paused,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Draft => "draft",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(JobStatus::Draft),
            "running" => Some(JobStatus::Running),
            "paused" => Some(JobStatus::Paused),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Completed and failed jobs never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Allowed transitions. `Paused → Failed` is the operator stopping a paused job.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (*self, next),
            (Draft, Running)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Paused, Running)
                | (Paused, Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a job sends to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Bulk send from one instance to a contact list.
    Campaign,
    /// Own instances messaging each other to build reputation.
    Warming,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Campaign => "campaign",
            JobKind::Warming => "warming",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "campaign" => Some(JobKind::Campaign),
            "warming" => Some(JobKind::Warming),
            _ => None,
        }
    }
}

/// Inter-message jitter and batch pauses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PacingConfig {
    pub min_delay_secs: u64,
    pub max_delay_secs: u64,
    /// Pause after this many successful sends; 0 disables batch pauses.
    pub pause_after: u32,
    pub pause_duration_secs: u64,
}

impl PacingConfig {
    pub fn from_defaults(config: &DispatchConfig) -> Self {
        Self {
            min_delay_secs: config.min_delay_secs,
            max_delay_secs: config.max_delay_secs,
            pause_after: config.pause_after,
            pause_duration_secs: config.pause_duration_secs,
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self::from_defaults(&DispatchConfig::default())
    }
}

/// Local time-of-day window in which sends may start. `start > end` wraps
/// past midnight.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BusinessHours {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl BusinessHours {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Parse `"HH:MM"` or `"HH:MM:SS"` bounds.
    pub fn parse(start: &str, end: &str) -> Option<Self> {
        Some(Self {
            start: hhmm::parse(start)?,
            end: hhmm::parse(end)?,
        })
    }

    /// Both bounds inclusive.
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.end {
            t >= self.start && t <= self.end
        } else {
            t >= self.start || t <= self.end
        }
    }
}

impl std::fmt::Display for BusinessHours {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}–{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

/// `NaiveTime` as `"HH:MM"` on the wire; seconds accepted on input.
pub(crate) mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(s: &str) -> Option<NaiveTime> {
        let s = s.trim();
        NaiveTime::parse_from_str(s, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
            .ok()
    }

    pub fn format(t: &NaiveTime) -> String {
        t.format("%H:%M").to_string()
    }

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format(t))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid time '{raw}', expected HH:MM")))
    }
}

/// One bulk-send run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchJob {
    pub id: String,
    pub name: String,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Sending instance (campaigns).
    pub instance_id: Option<String>,
    /// Campaign body with `{{key}}` placeholders.
    pub message_template: String,
    /// Warm-up phrases, one picked at random per pair.
    pub message_pool: Vec<String>,
    pub pacing: PacingConfig,
    pub window: Option<BusinessHours>,
    pub sent: u32,
    pub failed: u32,
    pub total: u32,
    /// Integer percentage, never decreases.
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl DispatchJob {
    /// Build a draft job from a create request.
    pub fn draft(req: NewJob, defaults: &PacingConfig) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: req.name,
            kind: req.kind,
            status: JobStatus::Draft,
            instance_id: req.instance_id.filter(|s| !s.is_empty()),
            message_template: req.message_template,
            message_pool: req.message_pool,
            pacing: req.pacing.unwrap_or_else(|| defaults.clone()),
            window: req.window,
            sent: 0,
            failed: 0,
            total: 0,
            progress: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn processed(&self) -> u32 {
        self.sent + self.failed
    }
}

/// Create-job request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    pub kind: JobKind,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub message_template: String,
    #[serde(default)]
    pub message_pool: Vec<String>,
    /// Falls back to the configured defaults.
    #[serde(default)]
    pub pacing: Option<PacingConfig>,
    #[serde(default)]
    pub window: Option<BusinessHours>,
}

/// Who a work item delivers to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchTarget {
    /// A contact of a campaign.
    Contact {
        phone: String,
        #[serde(default)]
        name: Option<String>,
    },
    /// A warm-up exchange: `from_instance` messages `to_instance`'s number.
    InstancePair {
        from_instance: String,
        to_instance: String,
    },
}

impl DispatchTarget {
    pub fn kind(&self) -> JobKind {
        match self {
            DispatchTarget::Contact { .. } => JobKind::Campaign,
            DispatchTarget::InstancePair { .. } => JobKind::Warming,
        }
    }
}

/// Per-item status; only ever moves forward from `Pending`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Sent,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Sent => "sent",
            ItemStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ItemStatus::Pending),
            "sent" => Some(ItemStatus::Sent),
            "failed" => Some(ItemStatus::Failed),
            _ => None,
        }
    }
}

/// One deliverable unit of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i64,
    pub job_id: String,
    pub target: DispatchTarget,
    pub status: ItemStatus,
    pub variables: HashMap<String, String>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Add-items request entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewItem {
    pub target: DispatchTarget,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

impl NewItem {
    pub fn contact(phone: &str, name: Option<&str>) -> Self {
        Self {
            target: DispatchTarget::Contact {
                phone: phone.to_string(),
                name: name.map(String::from),
            },
            variables: HashMap::new(),
        }
    }

    pub fn pair(from_instance: &str, to_instance: &str) -> Self {
        Self {
            target: DispatchTarget::InstancePair {
                from_instance: from_instance.to_string(),
                to_instance: to_instance.to_string(),
            },
            variables: HashMap::new(),
        }
    }

    pub fn with_var(mut self, key: &str, value: &str) -> Self {
        self.variables.insert(key.to_string(), value.to_string());
        self
    }
}

/// A connected WhatsApp number (a UAZAPI instance) that messages go out from.
#[derive(Debug, Clone, Serialize)]
pub struct SendingInstance {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub token: String,
    pub phone: String,
    pub connected: bool,
    pub daily_limit: u32,
    pub window: Option<BusinessHours>,
    pub created_at: DateTime<Utc>,
}

/// Register-instance request.
#[derive(Debug, Clone, Deserialize)]
pub struct NewInstance {
    pub name: String,
    pub token: String,
    pub phone: String,
    #[serde(default = "default_true")]
    pub connected: bool,
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    #[serde(default)]
    pub window: Option<BusinessHours>,
}

fn default_true() -> bool {
    true
}

fn default_daily_limit() -> u32 {
    200
}

impl SendingInstance {
    pub fn register(req: NewInstance) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: req.name,
            token: req.token,
            phone: req.phone,
            connected: req.connected,
            daily_limit: req.daily_limit,
            window: req.window,
            created_at: Utc::now(),
        }
    }
}

/// Per-instance daily counter.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SendQuota {
    pub instance_id: String,
    pub sent_today: u32,
    pub daily_limit: u32,
    pub last_reset_date: NaiveDate,
}

/// Audit-trail event kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    Created,
    Started,
    Sent,
    Error,
    BatchPause,
    DailyLimit,
    AutoPaused,
    Completed,
    Paused,
    Resumed,
    Stopped,
}

impl LogEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogEvent::Created => "created",
            LogEvent::Started => "started",
            LogEvent::Sent => "sent",
            LogEvent::Error => "error",
            LogEvent::BatchPause => "batch_pause",
            LogEvent::DailyLimit => "daily_limit",
            LogEvent::AutoPaused => "auto_paused",
            LogEvent::Completed => "completed",
            LogEvent::Paused => "paused",
            LogEvent::Resumed => "resumed",
            LogEvent::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "created" => LogEvent::Created,
            "started" => LogEvent::Started,
            "sent" => LogEvent::Sent,
            "error" => LogEvent::Error,
            "batch_pause" => LogEvent::BatchPause,
            "daily_limit" => LogEvent::DailyLimit,
            "auto_paused" => LogEvent::AutoPaused,
            "completed" => LogEvent::Completed,
            "paused" => LogEvent::Paused,
            "resumed" => LogEvent::Resumed,
            "stopped" => LogEvent::Stopped,
            _ => return None,
        })
    }
}

/// Append-only audit record.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchLogEntry {
    pub id: i64,
    pub job_id: String,
    pub item_id: Option<i64>,
    pub event: LogEvent,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

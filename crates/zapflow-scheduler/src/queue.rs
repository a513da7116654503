//! Work queue. Hands out one pending item at a time and records its outcome.
//!
//! A single worker owns each job, so claiming is just "read the oldest
//! pending row"; the item stays `pending` until `mark_resolved` in the same
//! loop iteration.

use std::sync::Arc;
use zapflow_core::error::Result;

use crate::job::{DispatchJob, ItemStatus, NewItem, WorkItem};
use crate::persistence::DispatchDb;

/// Terminal outcome of one send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    Failed,
}

impl From<Outcome> for ItemStatus {
    fn from(o: Outcome) -> Self {
        match o {
            Outcome::Sent => ItemStatus::Sent,
            Outcome::Failed => ItemStatus::Failed,
        }
    }
}

/// Result of `mark_resolved`.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// The item moved out of `pending`; carries the job with updated counters.
    Resolved(DispatchJob),
    /// The item was already resolved. Nothing changed.
    AlreadyResolved,
}

/// Result of `attach`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct AttachOutcome {
    pub count: u32,
    pub total: u32,
}

#[derive(Clone)]
pub struct WorkQueue {
    db: Arc<DispatchDb>,
}

impl WorkQueue {
    pub fn new(db: Arc<DispatchDb>) -> Self {
        Self { db }
    }

    /// Oldest pending item, or `None` when the job has nothing left.
    pub fn next_pending(&self, job_id: &str) -> Result<Option<WorkItem>> {
        self.db.next_pending(job_id)
    }

    /// Resolve a pending item. Resolving twice is a logged no-op.
    pub fn mark_resolved(
        &self,
        item_id: i64,
        outcome: Outcome,
        detail: Option<&str>,
    ) -> Result<Resolution> {
        match self.db.resolve_item(item_id, outcome.into(), detail)? {
            Some(job) => Ok(Resolution::Resolved(job)),
            None => {
                tracing::warn!("⚠️ Item {item_id} already resolved, ignoring {outcome:?}");
                Ok(Resolution::AlreadyResolved)
            }
        }
    }

    /// Bulk-insert pending items and refresh the job's total.
    pub fn attach(&self, job_id: &str, items: &[NewItem]) -> Result<AttachOutcome> {
        let (count, total) = self.db.attach_items(job_id, items)?;
        tracing::debug!("📥 Attached {count} items to job {job_id} (total {total})");
        Ok(AttachOutcome { count, total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobKind, NewJob, PacingConfig};

    fn setup() -> (WorkQueue, String) {
        let db = Arc::new(DispatchDb::open_in_memory().unwrap());
        let job = DispatchJob::draft(
            NewJob {
                name: "q".into(),
                kind: JobKind::Campaign,
                instance_id: None,
                message_template: "hi".into(),
                message_pool: vec![],
                pacing: None,
                window: None,
            },
            &PacingConfig::default(),
        );
        db.insert_job(&job).unwrap();
        (WorkQueue::new(db), job.id)
    }

    #[test]
    fn test_fifo_claim_order() {
        let (queue, job_id) = setup();
        queue
            .attach(&job_id, &[NewItem::contact("111", None), NewItem::contact("222", None)])
            .unwrap();
        let first = queue.next_pending(&job_id).unwrap().unwrap();
        assert!(matches!(&first.target, crate::job::DispatchTarget::Contact { phone, .. } if phone == "111"));
        queue.mark_resolved(first.id, Outcome::Sent, None).unwrap();
        let second = queue.next_pending(&job_id).unwrap().unwrap();
        assert_ne!(first.id, second.id);
        queue.mark_resolved(second.id, Outcome::Failed, Some("boom")).unwrap();
        assert!(queue.next_pending(&job_id).unwrap().is_none());
    }

    #[test]
    fn test_double_resolve_is_noop() {
        let (queue, job_id) = setup();
        queue.attach(&job_id, &[NewItem::contact("111", None)]).unwrap();
        let item = queue.next_pending(&job_id).unwrap().unwrap();

        let first = queue.mark_resolved(item.id, Outcome::Failed, Some("timeout")).unwrap();
        assert!(matches!(first, Resolution::Resolved(ref j) if j.failed == 1));

        let second = queue.mark_resolved(item.id, Outcome::Sent, None).unwrap();
        assert!(matches!(second, Resolution::AlreadyResolved));
        let stored = queue.db.get_item(item.id).unwrap().unwrap();
        assert_eq!(stored.status, ItemStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_attach_reports_running_total() {
        let (queue, job_id) = setup();
        let a = queue.attach(&job_id, &[NewItem::contact("1", None)]).unwrap();
        assert_eq!(a, AttachOutcome { count: 1, total: 1 });
        let b = queue
            .attach(&job_id, &[NewItem::contact("2", None), NewItem::contact("3", None)])
            .unwrap();
        assert_eq!(b, AttachOutcome { count: 2, total: 3 });
    }
}

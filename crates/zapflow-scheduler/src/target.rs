//! Turns a work item into a concrete send: which instance, to which phone,
//! with what text. Campaign contacts and warm-up pairs share the loop and
//! only differ here.

use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use zapflow_channels::{normalize_phone, render_template};
use zapflow_core::error::ZapflowError;

use crate::job::{DispatchJob, DispatchTarget, NewItem, SendingInstance, WorkItem};
use crate::persistence::DispatchDb;

#[derive(Debug, Error)]
pub enum ResolveError {
    /// The item cannot be sent; it is failed with this reason.
    #[error("{0}")]
    Unresolvable(String),
    #[error(transparent)]
    Storage(#[from] ZapflowError),
}

/// Everything the sender needs for one item.
#[derive(Debug, Clone)]
pub struct ResolvedSend {
    pub instance: SendingInstance,
    pub recipient: String,
    pub text: String,
}

#[derive(Clone)]
pub struct TargetResolver {
    db: Arc<DispatchDb>,
    country_code: String,
}

impl TargetResolver {
    pub fn new(db: Arc<DispatchDb>, country_code: impl Into<String>) -> Self {
        Self {
            db,
            country_code: country_code.into(),
        }
    }

    pub fn resolve(&self, job: &DispatchJob, item: &WorkItem) -> Result<ResolvedSend, ResolveError> {
        match &item.target {
            DispatchTarget::Contact { phone, name } => {
                self.resolve_contact(job, item, phone, name.as_deref())
            }
            DispatchTarget::InstancePair {
                from_instance,
                to_instance,
            } => self.resolve_pair(job, item, from_instance, to_instance),
        }
    }

    fn connected_instance(&self, id: &str) -> Result<SendingInstance, ResolveError> {
        match self.db.get_instance(id)? {
            Some(i) if i.connected => Ok(i),
            Some(i) => Err(ResolveError::Unresolvable(format!(
                "instance '{}' is disconnected",
                i.name
            ))),
            None => Err(ResolveError::Unresolvable(format!("instance {id} not found"))),
        }
    }

    fn resolve_contact(
        &self,
        job: &DispatchJob,
        item: &WorkItem,
        phone: &str,
        name: Option<&str>,
    ) -> Result<ResolvedSend, ResolveError> {
        let Some(instance_id) = job.instance_id.as_deref() else {
            return Err(ResolveError::Unresolvable("campaign has no sending instance".into()));
        };
        let instance = self.connected_instance(instance_id)?;

        let recipient = normalize_phone(phone, &self.country_code);
        if recipient.is_empty() {
            return Err(ResolveError::Unresolvable(format!("invalid phone '{phone}'")));
        }

        let mut vars: HashMap<String, String> = item.variables.clone();
        vars.entry("phone".into()).or_insert_with(|| phone.to_string());
        if let Some(name) = name {
            vars.entry("name".into()).or_insert_with(|| name.to_string());
        }

        Ok(ResolvedSend {
            instance,
            recipient,
            text: render_template(&job.message_template, &vars),
        })
    }

    fn resolve_pair(
        &self,
        job: &DispatchJob,
        item: &WorkItem,
        from_id: &str,
        to_id: &str,
    ) -> Result<ResolvedSend, ResolveError> {
        if from_id == to_id {
            return Err(ResolveError::Unresolvable("instance cannot warm itself".into()));
        }
        let from = self.connected_instance(from_id)?;
        let Some(to) = self.db.get_instance(to_id)? else {
            return Err(ResolveError::Unresolvable(format!("instance {to_id} not found")));
        };

        let recipient = normalize_phone(&to.phone, &self.country_code);
        if recipient.is_empty() {
            return Err(ResolveError::Unresolvable(format!(
                "instance '{}' has no phone number",
                to.name
            )));
        }

        let template = match item.variables.get("message") {
            Some(m) if !m.trim().is_empty() => m.clone(),
            _ => job
                .message_pool
                .choose(&mut rand::thread_rng())
                .cloned()
                .ok_or_else(|| ResolveError::Unresolvable("message pool is empty".into()))?,
        };

        let mut vars = item.variables.clone();
        vars.insert("from".into(), from.name.clone());
        vars.insert("to".into(), to.name.clone());

        Ok(ResolvedSend {
            instance: from,
            recipient,
            text: render_template(&template, &vars),
        })
    }
}

/// Ordered pairs of distinct connected instances, every combination once per
/// round. Disconnected instances are skipped.
pub fn plan_warming_pairs(instances: &[SendingInstance], rounds: u32) -> Vec<NewItem> {
    let connected: Vec<&SendingInstance> = instances.iter().filter(|i| i.connected).collect();
    let mut items = Vec::new();
    if connected.len() < 2 {
        return items;
    }
    for _ in 0..rounds {
        for from in &connected {
            for to in &connected {
                if from.id != to.id {
                    items.push(NewItem::pair(&from.id, &to.id));
                }
            }
        }
    }
    items
}

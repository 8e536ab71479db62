// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance registry: live agent connections, cached database state and
//! status subscriptions.
//!
//! The registry is plain shared state handed around as `Arc<InstanceRegistry>`;
//! nothing here is a global. Delivery to an agent goes through a capacity-1
//! channel per instance, so producers naturally serialize behind the wire.
//! One undelivered task can be parked in the instance's resend slot and is
//! retransmitted first thing after the next registration, giving at-least-once
//! delivery across reconnects.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use pgfleet_protocol::fleet_proto::{DatabaseState, TaskPush};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::lifecycle::meaningful_transition;
use crate::model::{DbStatus, Stage};

/// One database status change as seen by subscribers.
#[derive(Debug, Clone)]
pub struct DbStatusEvent {
    pub instance_name: String,
    pub name: String,
    pub owner: String,
    pub stage: Stage,
    pub status: DbStatus,
    pub migrate_from: Option<String>,
    pub migrate_to: Option<String>,
    pub expired_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub error_msg: Option<String>,
}

impl DbStatusEvent {
    /// Decode a wire snapshot into an event.
    pub fn from_wire(state: &DatabaseState) -> Result<Self> {
        let stage = Stage::parse(&state.stage).ok_or_else(|| CoreError::ValidationError {
            field: "stage".to_string(),
            message: format!("unknown stage '{}'", state.stage),
        })?;
        let status = DbStatus::parse(&state.status).ok_or_else(|| CoreError::ValidationError {
            field: "status".to_string(),
            message: format!("unknown status '{}'", state.status),
        })?;
        let updated_at = Utc
            .timestamp_millis_opt(state.updated_at_ms)
            .single()
            .ok_or_else(|| CoreError::ValidationError {
                field: "updated_at_ms".to_string(),
                message: format!("out of range: {}", state.updated_at_ms),
            })?;
        let expired_at = match state.expired_at_ms {
            Some(ms) => Some(Utc.timestamp_millis_opt(ms).single().ok_or_else(|| {
                CoreError::ValidationError {
                    field: "expired_at_ms".to_string(),
                    message: format!("out of range: {}", ms),
                }
            })?),
            None => None,
        };
        Ok(Self {
            instance_name: state.instance_name.clone(),
            name: state.name.clone(),
            owner: state.owner.clone(),
            stage,
            status,
            migrate_from: state.migrate_from.clone(),
            migrate_to: state.migrate_to.clone(),
            expired_at,
            updated_at,
            error_msg: state.error_msg.clone(),
        })
    }

    /// Encode this event as a wire snapshot.
    pub fn to_wire(&self) -> DatabaseState {
        DatabaseState {
            name: self.name.clone(),
            owner: self.owner.clone(),
            instance_name: self.instance_name.clone(),
            stage: self.stage.as_str().to_string(),
            status: self.status.as_str().to_string(),
            migrate_from: self.migrate_from.clone(),
            migrate_to: self.migrate_to.clone(),
            expired_at_ms: self.expired_at.map(|t| t.timestamp_millis()),
            updated_at_ms: self.updated_at.timestamp_millis(),
            error_msg: self.error_msg.clone(),
        }
    }
}

/// Instance-level availability change.
#[derive(Debug, Clone)]
pub enum InstanceEvent {
    Online { name: String, pg_version: String },
    Offline { name: String },
}

/// Returned callbacks: `true` keeps the subscription, `false` removes it.
pub type DbStatusCallback = Box<dyn FnMut(&DbStatusEvent) -> bool + Send>;
pub type InstanceStatusCallback = Box<dyn FnMut(&InstanceEvent) -> bool + Send>;

/// Handed to the registration stream's serving loop.
pub struct Registration {
    /// Tasks queued for this agent. Closed when a newer registration for
    /// the same instance replaces this one.
    pub receiver: mpsc::Receiver<TaskPush>,
    /// Identifies this registration; resend-slot and offline operations
    /// from a stale serving loop are ignored.
    pub epoch: u64,
}

#[derive(Default)]
struct InstanceEntry {
    pg_version: String,
    online: bool,
    epoch: u64,
    sender: Option<mpsc::Sender<TaskPush>>,
    resend: Option<TaskPush>,
    databases: HashMap<String, DbStatusEvent>,
}

/// Registry of instances, their agents and cached database state.
#[derive(Default)]
pub struct InstanceRegistry {
    instances: Mutex<HashMap<String, InstanceEntry>>,
    db_subs: Mutex<Vec<DbStatusCallback>>,
    instance_subs: Mutex<Vec<InstanceStatusCallback>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register) an agent for `instance`.
    ///
    /// Any previous registration's channel is closed; its serving loop winds
    /// down on its own. Seed states update the cache like notifications do,
    /// so changes that happened while the agent was disconnected still reach
    /// subscribers.
    pub fn register(
        &self,
        instance: &str,
        pg_version: &str,
        seeds: Vec<DbStatusEvent>,
    ) -> Registration {
        let (tx, rx) = mpsc::channel(1);

        let mut fan_out = Vec::new();
        let epoch = {
            let mut guard = self.instances.lock().unwrap();
            let entry = guard.entry(instance.to_string()).or_default();

            if entry.online {
                warn!(instance, "replacing live registration");
            }
            if !entry.pg_version.is_empty() && entry.pg_version != pg_version {
                info!(
                    instance,
                    old = %entry.pg_version,
                    new = %pg_version,
                    "instance reports new PostgreSQL version"
                );
            }

            entry.pg_version = pg_version.to_string();
            entry.online = true;
            entry.epoch += 1;
            entry.sender = Some(tx);

            for seed in seeds {
                if let Some(event) = Self::apply_to_cache(entry, seed) {
                    fan_out.push(event);
                }
            }

            entry.epoch
        };

        for event in fan_out {
            self.fan_out_db(&event);
        }
        self.fan_out_instance(&InstanceEvent::Online {
            name: instance.to_string(),
            pg_version: pg_version.to_string(),
        });

        info!(instance, epoch, %pg_version, "agent registered");
        Registration { receiver: rx, epoch }
    }

    /// Mark the instance offline. Ignored when a newer registration has
    /// already taken over.
    pub fn mark_offline(&self, instance: &str, epoch: u64) {
        let went_offline = {
            let mut guard = self.instances.lock().unwrap();
            match guard.get_mut(instance) {
                Some(entry) if entry.epoch == epoch && entry.online => {
                    entry.online = false;
                    entry.sender = None;
                    true
                }
                _ => false,
            }
        };

        if went_offline {
            info!(instance, "agent disconnected");
            self.fan_out_instance(&InstanceEvent::Offline {
                name: instance.to_string(),
            });
        }
    }

    /// Take the parked unacknowledged task, if any. The serving loop calls
    /// this before draining the queue so the parked task goes out first.
    pub fn take_resend(&self, instance: &str, epoch: u64) -> Option<TaskPush> {
        let mut guard = self.instances.lock().unwrap();
        match guard.get_mut(instance) {
            Some(entry) if entry.epoch == epoch => entry.resend.take(),
            _ => None,
        }
    }

    /// Park a task whose transmission failed so the next registration
    /// retransmits it.
    pub fn park_resend(&self, instance: &str, task: TaskPush) {
        let mut guard = self.instances.lock().unwrap();
        let Some(entry) = guard.get_mut(instance) else {
            warn!(instance, task_id = %task.task_id, "dropping task for unknown instance");
            return;
        };
        if let Some(parked) = &entry.resend {
            // Single slot: the serving loop is the only parker per epoch,
            // so this indicates delivery for a stale epoch.
            warn!(
                instance,
                parked = %parked.task_id,
                dropped = %task.task_id,
                "resend slot occupied, dropping task"
            );
            return;
        }
        debug!(instance, task_id = %task.task_id, "parked task for resend");
        entry.resend = Some(task);
    }

    /// Queue a task for delivery to the instance's agent.
    ///
    /// Blocks while a previous task is still being handed to the wire
    /// (capacity-1 queue). When the agent is offline the task is parked in
    /// the resend slot instead; a second push while the slot is occupied
    /// fails with `DeliveryBusy`.
    pub async fn push_task(&self, instance: &str, task: TaskPush) -> Result<()> {
        let sender = {
            let mut guard = self.instances.lock().unwrap();
            let Some(entry) = guard.get_mut(instance) else {
                return Err(CoreError::InstanceNotFound {
                    instance: instance.to_string(),
                });
            };
            match (&entry.sender, entry.online) {
                (Some(sender), true) => sender.clone(),
                _ => {
                    if entry.resend.is_none() {
                        debug!(instance, task_id = %task.task_id, "agent offline, parking task");
                        entry.resend = Some(task);
                        return Ok(());
                    }
                    return Err(CoreError::DeliveryBusy {
                        instance: instance.to_string(),
                    });
                }
            }
        };

        sender
            .send(task)
            .await
            .map_err(|_| CoreError::InstanceOffline {
                instance: instance.to_string(),
            })
    }

    /// Whether the instance currently has a live agent connection.
    pub fn is_online(&self, instance: &str) -> bool {
        self.instances
            .lock()
            .unwrap()
            .get(instance)
            .is_some_and(|e| e.online)
    }

    /// Cached state for one database, if any.
    pub fn cached(&self, instance: &str, name: &str) -> Option<DbStatusEvent> {
        self.instances
            .lock()
            .unwrap()
            .get(instance)
            .and_then(|e| e.databases.get(name).cloned())
    }

    /// Apply a status report to the cache and notify subscribers.
    ///
    /// Returns `Ok(true)` when the report was fresh and meaningful (and
    /// subscribers fired), `Ok(false)` when it was a duplicate, stale, or
    /// changed neither stage nor status. Instances without an agent (served
    /// directly by the coordinator) get a cache entry on first report.
    pub fn apply_db_status(&self, event: DbStatusEvent) -> Result<bool> {
        let fan_out = {
            let mut guard = self.instances.lock().unwrap();
            let entry = guard.entry(event.instance_name.clone()).or_default();
            Self::apply_to_cache(entry, event)
        };

        match fan_out {
            Some(event) => {
                self.fan_out_db(&event);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn apply_to_cache(entry: &mut InstanceEntry, event: DbStatusEvent) -> Option<DbStatusEvent> {
        let meaningful = match entry.databases.get(&event.name) {
            // Same or older timestamp: duplicate delivery, drop entirely.
            Some(prev) if prev.updated_at >= event.updated_at => {
                debug!(
                    db = %event.name,
                    instance = %event.instance_name,
                    "dropping duplicate status report"
                );
                return None;
            }
            Some(prev) => {
                meaningful_transition((prev.stage, prev.status), (event.stage, event.status))
            }
            None => true,
        };

        entry.databases.insert(event.name.clone(), event.clone());
        meaningful.then_some(event)
    }

    /// Subscribe to database status changes. The callback runs inside the
    /// notifier's critical section and must not block; returning `false`
    /// removes the subscription.
    pub fn subscribe_db_status<F>(&self, callback: F)
    where
        F: FnMut(&DbStatusEvent) -> bool + Send + 'static,
    {
        self.db_subs.lock().unwrap().push(Box::new(callback));
    }

    /// Subscribe to instance online/offline changes.
    pub fn subscribe_instance_status<F>(&self, callback: F)
    where
        F: FnMut(&InstanceEvent) -> bool + Send + 'static,
    {
        self.instance_subs.lock().unwrap().push(Box::new(callback));
    }

    /// Wait until the given database reports a state matching `pred`.
    ///
    /// Checks the cache first so a state that arrived before the call is
    /// not missed, then waits on a one-shot subscription.
    pub async fn wait_for_db<F>(
        &self,
        instance: &str,
        name: &str,
        pred: F,
        timeout: Duration,
    ) -> Result<Option<DbStatusEvent>>
    where
        F: Fn(&DbStatusEvent) -> bool + Send + Sync + 'static,
    {
        let pred = std::sync::Arc::new(pred);
        if let Some(cached) = self.cached(instance, name)
            && pred(&cached)
        {
            return Ok(Some(cached));
        }

        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        let instance_owned = instance.to_string();
        let name_owned = name.to_string();
        let sub_pred = pred.clone();
        self.subscribe_db_status(move |event| {
            // Drop the subscription once the waiter has gone away.
            let Some(sender) = tx.as_ref() else {
                return false;
            };
            if sender.is_closed() {
                return false;
            }
            if event.instance_name == instance_owned && event.name == name_owned && sub_pred(event)
            {
                if let Some(sender) = tx.take() {
                    let _ = sender.send(event.clone());
                }
                return false;
            }
            true
        });

        // A report applied between the first cache check and the
        // subscription would reach neither; check again now that the
        // subscription is in place.
        if let Some(cached) = self.cached(instance, name)
            && pred(&cached)
        {
            return Ok(Some(cached));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(event)) => Ok(Some(event)),
            // Registry dropped; treat like a timeout.
            Ok(Err(_)) => Ok(None),
            Err(_) => Ok(None),
        }
    }

    fn fan_out_db(&self, event: &DbStatusEvent) {
        let mut subs = self.db_subs.lock().unwrap();
        // Rebuild the list, keeping only subscriptions that want to stay.
        let mut kept = Vec::with_capacity(subs.len());
        for mut callback in subs.drain(..) {
            if callback(event) {
                kept.push(callback);
            }
        }
        *subs = kept;
    }

    fn fan_out_instance(&self, event: &InstanceEvent) {
        let mut subs = self.instance_subs.lock().unwrap();
        let mut kept = Vec::with_capacity(subs.len());
        for mut callback in subs.drain(..) {
            if callback(event) {
                kept.push(callback);
            }
        }
        *subs = kept;
    }
}

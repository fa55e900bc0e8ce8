//! Durable resize schedule store backed by redb
//!
//! `schedules` maps an instance id to its single current record.
//! `schedule_history` keeps every terminal record under
//! `{instance_id}:{created_micros}:{schedule_id}` for audit.
//!
//! Every mutation runs inside one redb write transaction. Write transactions
//! are serialized, so read-check-write sequences here act as atomic
//! compare-and-replace operations on the pending slot of each instance.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::debug;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::models::{OutcomeStatus, ResizeSchedule, ScheduleState};

/// Current record per instance, keyed by instance id
const SCHEDULES: TableDefinition<&str, &[u8]> = TableDefinition::new("schedules");

/// Terminal records keyed by `{instance_id}:{created_micros}:{schedule_id}`
const SCHEDULE_HISTORY: TableDefinition<&str, &[u8]> = TableDefinition::new("schedule_history");

macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

fn encode(schedule: &ResizeSchedule) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(schedule).map_err(map_err!(Serialize))
}

fn decode(bytes: &[u8]) -> StoreResult<ResizeSchedule> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn history_key(schedule: &ResizeSchedule) -> String {
    format!(
        "{}:{:020}:{}",
        schedule.instance_id,
        schedule.created_at.timestamp_micros(),
        schedule.schedule_id
    )
}

/// Result of writing a new pending schedule
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    /// No pending record existed for the instance
    Created,
    /// An older pending record was stamped cancelled and replaced
    Replaced { previous: ResizeSchedule },
    /// A newer pending record already holds the slot; the incoming one was
    /// recorded as cancelled
    Stale { current: ResizeSchedule },
    /// The current pending record is claimed by a running executor
    InFlight { current: ResizeSchedule },
}

/// Result of a cancellation request
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    NoPending,
    Cancelled(ResizeSchedule),
    /// An execution already owns the record; honoured only before it stops
    /// the instance
    Requested(ResizeSchedule),
}

/// Result of an executor trying to take ownership of a schedule
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(ResizeSchedule),
    /// The schedule is terminal or was superseded
    NotPending(Option<ResizeSchedule>),
    AlreadyClaimed(ResizeSchedule),
}

/// Thread-safe schedule store
#[derive(Clone)]
pub struct ScheduleStore {
    db: Arc<Database>,
}

impl ScheduleStore {
    /// Open (or create) a persistent store at the given path
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "schedule store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory schedule store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(SCHEDULES).map_err(map_err!(Table))?;
        txn.open_table(SCHEDULE_HISTORY).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Install `incoming` as the pending schedule for its instance.
    ///
    /// Replace-if-pending: a pending record with an earlier `created_at`
    /// is stamped cancelled and moved to history. Ties go to the larger
    /// schedule id so concurrent writers agree on the winner.
    pub fn upsert_pending(&self, incoming: &ResizeSchedule) -> StoreResult<UpsertOutcome> {
        let key = incoming.instance_id.as_str();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome;
        {
            let mut current_table = txn.open_table(SCHEDULES).map_err(map_err!(Table))?;
            let mut history = txn.open_table(SCHEDULE_HISTORY).map_err(map_err!(Table))?;

            let existing = current_table
                .get(key)
                .map_err(map_err!(Read))?
                .map(|guard| decode(guard.value()))
                .transpose()?;

            outcome = match existing {
                Some(current) if current.is_pending() && current.is_claimed() => {
                    UpsertOutcome::InFlight { current }
                }
                Some(current) if current.is_pending() && !incoming.supersedes(&current) => {
                    let mut loser = incoming.clone();
                    loser.state = ScheduleState::Cancelled;
                    loser.cancel_reason = Some(format!("superseded by {}", current.schedule_id));
                    history
                        .insert(history_key(&loser).as_str(), encode(&loser)?.as_slice())
                        .map_err(map_err!(Write))?;
                    UpsertOutcome::Stale { current }
                }
                Some(previous) if previous.is_pending() => {
                    let mut replaced = previous.clone();
                    replaced.state = ScheduleState::Cancelled;
                    replaced.updated_at = incoming.created_at;
                    replaced.cancel_reason =
                        Some(format!("superseded by {}", incoming.schedule_id));
                    history
                        .insert(history_key(&replaced).as_str(), encode(&replaced)?.as_slice())
                        .map_err(map_err!(Write))?;
                    current_table
                        .insert(key, encode(incoming)?.as_slice())
                        .map_err(map_err!(Write))?;
                    UpsertOutcome::Replaced { previous }
                }
                _ => {
                    current_table
                        .insert(key, encode(incoming)?.as_slice())
                        .map_err(map_err!(Write))?;
                    UpsertOutcome::Created
                }
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(instance_id = %key, schedule_id = %incoming.schedule_id, ?outcome, "pending schedule upserted");
        Ok(outcome)
    }

    /// Cancel the pending schedule of an instance
    pub fn cancel(
        &self,
        instance_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<CancelOutcome> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome;
        {
            let mut current_table = txn.open_table(SCHEDULES).map_err(map_err!(Table))?;
            let mut history = txn.open_table(SCHEDULE_HISTORY).map_err(map_err!(Table))?;

            let existing = current_table
                .get(instance_id)
                .map_err(map_err!(Read))?
                .map(|guard| decode(guard.value()))
                .transpose()?;

            outcome = match existing {
                Some(mut record) if record.is_pending() && record.is_claimed() => {
                    record.cancel_requested = true;
                    record.cancel_reason = Some(reason.to_string());
                    record.updated_at = now;
                    current_table
                        .insert(instance_id, encode(&record)?.as_slice())
                        .map_err(map_err!(Write))?;
                    CancelOutcome::Requested(record)
                }
                Some(mut record) if record.is_pending() => {
                    record.state = ScheduleState::Cancelled;
                    record.cancel_reason = Some(reason.to_string());
                    record.updated_at = now;
                    let bytes = encode(&record)?;
                    current_table
                        .insert(instance_id, bytes.as_slice())
                        .map_err(map_err!(Write))?;
                    history
                        .insert(history_key(&record).as_str(), bytes.as_slice())
                        .map_err(map_err!(Write))?;
                    CancelOutcome::Cancelled(record)
                }
                _ => CancelOutcome::NoPending,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(outcome)
    }

    /// Take ownership of a pending schedule for execution.
    ///
    /// Compare-and-set on the current slot: succeeds only when the slot
    /// still holds `schedule_id`, pending and unclaimed.
    pub fn claim(
        &self,
        instance_id: &str,
        schedule_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<ClaimOutcome> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome;
        {
            let mut current_table = txn.open_table(SCHEDULES).map_err(map_err!(Table))?;
            let existing = current_table
                .get(instance_id)
                .map_err(map_err!(Read))?
                .map(|guard| decode(guard.value()))
                .transpose()?;

            outcome = match existing {
                Some(record) if record.schedule_id != schedule_id => {
                    ClaimOutcome::NotPending(None)
                }
                Some(record) if !record.is_pending() => ClaimOutcome::NotPending(Some(record)),
                Some(record) if record.is_claimed() => ClaimOutcome::AlreadyClaimed(record),
                Some(mut record) => {
                    record.claimed_at = Some(now);
                    record.updated_at = now;
                    current_table
                        .insert(instance_id, encode(&record)?.as_slice())
                        .map_err(map_err!(Write))?;
                    ClaimOutcome::Claimed(record)
                }
                None => ClaimOutcome::NotPending(None),
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;

        if let ClaimOutcome::NotPending(None) = outcome {
            // Superseded or never stored here; report the audited record if any
            return Ok(ClaimOutcome::NotPending(self.get(schedule_id)?));
        }
        Ok(outcome)
    }

    /// Stamp a claimed schedule cancelled if a cancellation arrived while it
    /// was in flight. Returns the stamped record.
    pub fn cancel_if_requested(
        &self,
        instance_id: &str,
        schedule_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ResizeSchedule>> {
        self.stamp_terminal(instance_id, schedule_id, now, |record| {
            if !record.cancel_requested {
                return false;
            }
            record.state = ScheduleState::Cancelled;
            true
        })
    }

    /// Stamp a claimed schedule fired with its outcome status
    pub fn complete(
        &self,
        instance_id: &str,
        schedule_id: Uuid,
        status: OutcomeStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ResizeSchedule>> {
        self.stamp_terminal(instance_id, schedule_id, now, move |record| {
            record.state = ScheduleState::Fired;
            record.result = Some(status.clone());
            true
        })
    }

    fn stamp_terminal<F>(
        &self,
        instance_id: &str,
        schedule_id: Uuid,
        now: DateTime<Utc>,
        apply: F,
    ) -> StoreResult<Option<ResizeSchedule>>
    where
        F: Fn(&mut ResizeSchedule) -> bool,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stamped;
        {
            let mut current_table = txn.open_table(SCHEDULES).map_err(map_err!(Table))?;
            let mut history = txn.open_table(SCHEDULE_HISTORY).map_err(map_err!(Table))?;

            let existing = current_table
                .get(instance_id)
                .map_err(map_err!(Read))?
                .map(|guard| decode(guard.value()))
                .transpose()?;

            stamped = match existing {
                Some(mut record) if record.schedule_id == schedule_id && record.is_pending() => {
                    if apply(&mut record) {
                        record.updated_at = now;
                        let bytes = encode(&record)?;
                        current_table
                            .insert(instance_id, bytes.as_slice())
                            .map_err(map_err!(Write))?;
                        history
                            .insert(history_key(&record).as_str(), bytes.as_slice())
                            .map_err(map_err!(Write))?;
                        Some(record)
                    } else {
                        None
                    }
                }
                _ => None,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(stamped)
    }

    /// Current record for an instance, pending or the last terminal one
    pub fn get_current(&self, instance_id: &str) -> StoreResult<Option<ResizeSchedule>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SCHEDULES).map_err(map_err!(Table))?;
        table
            .get(instance_id)
            .map_err(map_err!(Read))?
            .map(|guard| decode(guard.value()))
            .transpose()
    }

    /// Look a schedule up by id in the current slots, then in history
    pub fn get(&self, schedule_id: Uuid) -> StoreResult<Option<ResizeSchedule>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        for definition in [SCHEDULES, SCHEDULE_HISTORY] {
            let table = txn.open_table(definition).map_err(map_err!(Table))?;
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let record = decode(value.value())?;
                if record.schedule_id == schedule_id {
                    return Ok(Some(record));
                }
            }
        }
        Ok(None)
    }

    /// Terminal records for an instance, oldest first
    pub fn history(&self, instance_id: &str) -> StoreResult<Vec<ResizeSchedule>> {
        let prefix = format!("{}:", instance_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SCHEDULE_HISTORY).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                results.push(decode(value.value())?);
            }
        }
        Ok(results)
    }

    /// All pending records, claimed or not
    pub fn list_pending(&self) -> StoreResult<Vec<ResizeSchedule>> {
        self.scan_current(|record| record.is_pending())
    }

    /// Pending, unclaimed records whose execution time has elapsed
    pub fn list_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<ResizeSchedule>> {
        self.scan_current(|record| record.is_due(now))
    }

    /// Pending records claimed before `claimed_before` that never completed
    pub fn list_abandoned(&self, claimed_before: DateTime<Utc>) -> StoreResult<Vec<ResizeSchedule>> {
        self.scan_current(|record| {
            record.is_pending()
                && record
                    .claimed_at
                    .map(|claimed| claimed < claimed_before)
                    .unwrap_or(false)
        })
    }

    fn scan_current<F>(&self, keep: F) -> StoreResult<Vec<ResizeSchedule>>
    where
        F: Fn(&ResizeSchedule) -> bool,
    {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SCHEDULES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record = decode(value.value())?;
            if keep(&record) {
                results.push(record);
            }
        }
        Ok(results)
    }

    /// Overwrite the current slot of an instance with raw bytes
    #[cfg(test)]
    pub(crate) fn put_raw(&self, instance_id: &str, bytes: &[u8]) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SCHEDULES).map_err(map_err!(Table))?;
            table.insert(instance_id, bytes).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }
}

//! Deferred dispatch loop
//!
//! Periodically lists due pending schedules and spawns one executor task per
//! schedule. The local in-flight set only avoids spawning twice from this
//! process; exclusivity across processes comes from the store's claim.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::executor::{Execution, ResizeExecutor};
use crate::health::{components, HealthRegistry};
use crate::observability::ScalerMetrics;
use crate::store::ScheduleStore;

/// Configuration for the dispatch loop
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// How often the store is scanned for due schedules
    pub interval: Duration,
    /// How long shutdown waits for running executions
    pub shutdown_grace: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(60),
        }
    }
}

/// Removes a schedule id from the in-flight set when the task ends,
/// including when it panics or is aborted
struct InFlightGuard {
    set: Arc<DashSet<Uuid>>,
    schedule_id: Uuid,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.remove(&self.schedule_id);
    }
}

pub struct DispatchLoop {
    executor: ResizeExecutor,
    store: ScheduleStore,
    config: DispatchConfig,
    in_flight: Arc<DashSet<Uuid>>,
    metrics: Option<ScalerMetrics>,
    health: Option<HealthRegistry>,
}

impl DispatchLoop {
    pub fn new(executor: ResizeExecutor, store: ScheduleStore, config: DispatchConfig) -> Self {
        Self {
            executor,
            store,
            config,
            in_flight: Arc::new(DashSet::new()),
            metrics: None,
            health: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ScalerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Number of executions this process is currently running
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Stamp claims older than the executor's time budget as failed.
    ///
    /// Abandoned executions are never retried: the instance may be in any
    /// intermediate state, so an operator has to look at it.
    pub async fn recover_abandoned(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let budget = self.executor.config().time_budget();
        let cutoff = now
            - chrono::Duration::from_std(budget).unwrap_or_else(|_| chrono::Duration::hours(1));

        let mut recovered = 0;
        for record in self.store.list_abandoned(cutoff)? {
            if self.in_flight.contains(&record.schedule_id) {
                continue;
            }
            warn!(
                instance_id = %record.instance_id,
                schedule_id = %record.schedule_id,
                claimed_at = ?record.claimed_at,
                "Recovering abandoned resize execution"
            );
            if self.executor.fail_abandoned(&record).await?.is_some() {
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Spawn an execution for every due schedule not already running here
    pub fn dispatch_due(
        &self,
        tasks: &mut JoinSet<()>,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut spawned = 0;
        for schedule in self.store.list_due(now)? {
            let schedule_id = schedule.schedule_id;
            if !self.in_flight.insert(schedule_id) {
                continue;
            }

            debug!(
                instance_id = %schedule.instance_id,
                schedule_id = %schedule_id,
                "Dispatching due schedule"
            );
            let executor = self.executor.clone();
            let guard = InFlightGuard {
                set: self.in_flight.clone(),
                schedule_id,
            };
            let health = self.health.clone();
            tasks.spawn(async move {
                let _guard = guard;
                match executor.execute(&schedule).await {
                    Ok(Execution::Finished(outcome)) => {
                        debug!(
                            schedule_id = %schedule_id,
                            status = outcome.status.label(),
                            "Execution finished"
                        );
                    }
                    Ok(Execution::Skipped(reason)) => {
                        debug!(schedule_id = %schedule_id, reason = %reason, "Execution skipped");
                    }
                    Err(e) => {
                        error!(schedule_id = %schedule_id, error = %e, "Execution could not start");
                        if let Some(health) = health {
                            health
                                .set_degraded(components::EXECUTOR, e.to_string())
                                .await;
                        }
                    }
                }
            });
            spawned += 1;
        }
        Ok(spawned)
    }

    fn refresh_pending_gauge(&self) -> Result<(), StoreError> {
        if let Some(ref metrics) = self.metrics {
            metrics.set_pending_schedules(self.store.list_pending()?.len() as i64);
        }
        Ok(())
    }

    async fn report_store(&self, result: Result<(), StoreError>) {
        let Some(ref health) = self.health else {
            if let Err(e) = result {
                error!(error = %e, "Schedule store scan failed");
            }
            return;
        };
        match result {
            Ok(()) => health.set_healthy(components::STORE).await,
            Err(e) => {
                error!(error = %e, "Schedule store scan failed");
                health.set_unhealthy(components::STORE, e.to_string()).await;
            }
        }
    }

    async fn recover(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let recovered = self.recover_abandoned(now).await?;
        if recovered > 0 {
            info!(count = recovered, "Abandoned executions stamped failed");
        }
        Ok(())
    }

    /// Run until shutdown, then wait up to the grace period for executions.
    ///
    /// Each tick fails claims that outlived the time budget before
    /// dispatching new work.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting deferred dispatch loop"
        );

        let mut ticker = interval(self.config.interval);
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Utc::now();
                    if let Err(e) = self.recover(now).await {
                        error!(error = %e, "Failed to recover abandoned executions");
                    }
                    let result = self
                        .dispatch_due(&mut tasks, now)
                        .and_then(|spawned| {
                            if spawned > 0 {
                                info!(spawned, "Dispatched due schedules");
                            }
                            self.refresh_pending_gauge()
                        });
                    self.report_store(result).await;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Execution task panicked");
                    }
                }
                _ = shutdown.recv() => {
                    info!(in_flight = tasks.len(), "Shutting down dispatch loop");
                    break;
                }
            }
        }

        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                in_flight = tasks.len(),
                "Executions still running at shutdown; a dispatch loop fails their claims as abandoned once the time budget has elapsed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::RetryPolicy;
    use crate::check::ScaleCheck;
    use crate::error::PlatformError;
    use crate::evaluator::StaticMetricsSource;
    use crate::executor::{ExecutorConfig, ABANDONED_REASON};
    use crate::ladder::SizeLadder;
    use crate::models::{
        InstanceDescription, InstanceState, ManagedInstance, OutcomeStatus, ResizeSchedule,
        ScheduleRequest, ScheduleSource, ScheduleState, Thresholds, Utilization,
    };
    use crate::notifier::{LogTransport, Notifier};
    use crate::platform::{ComputePlatform, SimulatedPlatform};
    use crate::scheduler::ResizeScheduler;
    use crate::store::ClaimOutcome;
    use crate::window::MaintenanceWindow;
    use async_trait::async_trait;
    use chrono::{DateTime, FixedOffset, NaiveTime};

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig {
            poll_interval: Duration::from_millis(1),
            max_poll_interval: Duration::from_millis(2),
            ..ExecutorConfig::default()
        }
    }

    fn build(platform: Arc<dyn ComputePlatform>, config: ExecutorConfig) -> DispatchLoop {
        let store = ScheduleStore::open_in_memory().unwrap();
        let executor = ResizeExecutor::new(
            platform,
            store.clone(),
            Notifier::new(Arc::new(LogTransport)),
            config,
        );
        DispatchLoop::new(
            executor,
            store,
            DispatchConfig {
                interval: Duration::from_millis(5),
                shutdown_grace: Duration::from_secs(1),
            },
        )
    }

    fn setup() -> DispatchLoop {
        let platform = Arc::new(SimulatedPlatform::new(0));
        platform.add_instance("i-0abc", "m5.large");
        build(platform, fast_config())
    }

    fn pending(execution_time: &str) -> ResizeSchedule {
        pending_for("i-0abc", execution_time)
    }

    fn pending_for(instance_id: &str, execution_time: &str) -> ResizeSchedule {
        ResizeSchedule::pending(
            instance_id,
            "m5.xlarge",
            DateTime::parse_from_rfc3339(execution_time).unwrap(),
            ScheduleSource::Manual,
            Utc::now(),
        )
    }

    /// Panics on describe, after the executor has already claimed
    struct PanickingPlatform;

    #[async_trait]
    impl ComputePlatform for PanickingPlatform {
        async fn describe_instance(
            &self,
            instance_id: &str,
        ) -> Result<InstanceDescription, PlatformError> {
            panic!("describe_instance blew up for {}", instance_id);
        }

        async fn stop_instance(&self, _instance_id: &str) -> Result<(), PlatformError> {
            Ok(())
        }

        async fn start_instance(&self, _instance_id: &str) -> Result<(), PlatformError> {
            Ok(())
        }

        async fn modify_size_class(
            &self,
            _instance_id: &str,
            _target: &str,
        ) -> Result<(), PlatformError> {
            Ok(())
        }
    }

    fn managed(instance_id: &str) -> ManagedInstance {
        ManagedInstance {
            instance_id: instance_id.to_string(),
            thresholds: Thresholds {
                cpu_upsize: 85.0,
                cpu_downsize: 20.0,
                mem_upsize: 85.0,
                mem_downsize: 20.0,
            },
            ladder: SizeLadder::new(["m5.large", "m5.xlarge", "m5.2xlarge"], None).unwrap(),
            notification_channel: "ops".to_string(),
            metric_window_secs: 3600,
            maintenance_window: MaintenanceWindow::new(
                NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
                FixedOffset::east_opt(0).unwrap(),
            ),
        }
    }

    #[tokio::test]
    async fn test_dispatch_runs_due_schedule() {
        let dispatch = setup();
        let schedule = pending("2025-01-01T02:00:00+08:00");
        dispatch.store.upsert_pending(&schedule).unwrap();

        let mut tasks = JoinSet::new();
        assert_eq!(dispatch.dispatch_due(&mut tasks, Utc::now()).unwrap(), 1);
        while tasks.join_next().await.is_some() {}

        let stored = dispatch.store.get_current("i-0abc").unwrap().unwrap();
        assert_eq!(stored.state, ScheduleState::Fired);
        assert_eq!(stored.result, Some(OutcomeStatus::Succeeded));
        assert_eq!(dispatch.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_future_schedule_not_dispatched() {
        let dispatch = setup();
        let schedule = pending("2999-01-01T02:00:00+00:00");
        dispatch.store.upsert_pending(&schedule).unwrap();

        let mut tasks = JoinSet::new();
        assert_eq!(dispatch.dispatch_due(&mut tasks, Utc::now()).unwrap(), 0);
        assert!(dispatch
            .store
            .get_current("i-0abc")
            .unwrap()
            .unwrap()
            .is_pending());
    }

    #[tokio::test]
    async fn test_in_flight_schedule_not_spawned_twice() {
        let dispatch = setup();
        let schedule = pending("2025-01-01T02:00:00+08:00");
        dispatch.store.upsert_pending(&schedule).unwrap();
        dispatch.in_flight.insert(schedule.schedule_id);

        let mut tasks = JoinSet::new();
        assert_eq!(dispatch.dispatch_due(&mut tasks, Utc::now()).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_recover_abandoned_claims() {
        let dispatch = setup();
        let schedule = pending("2025-01-01T02:00:00+08:00");
        dispatch.store.upsert_pending(&schedule).unwrap();
        let claimed_at = Utc::now() - chrono::Duration::days(1);
        assert!(matches!(
            dispatch
                .store
                .claim("i-0abc", schedule.schedule_id, claimed_at)
                .unwrap(),
            ClaimOutcome::Claimed(_)
        ));

        assert_eq!(dispatch.recover_abandoned(Utc::now()).await.unwrap(), 1);

        let stored = dispatch.store.get_current("i-0abc").unwrap().unwrap();
        assert_eq!(stored.state, ScheduleState::Fired);
        assert!(matches!(stored.result, Some(OutcomeStatus::Failed { .. })));
    }

    #[tokio::test]
    async fn test_recent_claim_not_recovered() {
        let dispatch = setup();
        let schedule = pending("2025-01-01T02:00:00+08:00");
        dispatch.store.upsert_pending(&schedule).unwrap();
        dispatch
            .store
            .claim("i-0abc", schedule.schedule_id, Utc::now())
            .unwrap();

        assert_eq!(dispatch.recover_abandoned(Utc::now()).await.unwrap(), 0);
        assert!(dispatch
            .store
            .get_current("i-0abc")
            .unwrap()
            .unwrap()
            .is_pending());
    }

    #[tokio::test]
    async fn test_run_executes_and_stops_on_shutdown() {
        let dispatch = setup();
        let store = dispatch.store.clone();
        let schedule = pending("2025-01-01T02:00:00+08:00");
        store.upsert_pending(&schedule).unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(dispatch.run(shutdown_rx));

        let fired = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = store.get_current("i-0abc").unwrap().unwrap();
                if current.state == ScheduleState::Fired {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(fired.is_ok());

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_young_claim_recovered_once_budget_elapses() {
        // stop 10ms + start 2 * 10ms + no retries + 2 * 2ms
        let config = ExecutorConfig {
            poll_interval: Duration::from_millis(1),
            max_poll_interval: Duration::from_millis(2),
            stop_timeout: Duration::from_millis(10),
            start_timeout: Duration::from_millis(10),
            retry: RetryPolicy {
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(1),
                max_attempts: 1,
            },
        };
        assert_eq!(config.time_budget(), Duration::from_millis(34));

        let platform = Arc::new(SimulatedPlatform::new(0));
        platform.add_instance("i-0abc", "m5.large");
        let dispatch = build(platform, config);
        let store = dispatch.store.clone();

        // Claimed by a process that died just before this loop started
        let schedule = pending("2025-01-01T02:00:00+08:00");
        store.upsert_pending(&schedule).unwrap();
        store
            .claim("i-0abc", schedule.schedule_id, Utc::now())
            .unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(dispatch.run(shutdown_rx));

        let recovered = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = store.get(schedule.schedule_id).unwrap().unwrap();
                if current.state == ScheduleState::Fired {
                    return current;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("claim should be failed once its budget elapses");

        assert_eq!(
            recovered.result,
            Some(OutcomeStatus::Failed {
                reason: ABANDONED_REASON.to_string()
            })
        );

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_panicked_execution_clears_in_flight_and_is_recoverable() {
        let dispatch = build(Arc::new(PanickingPlatform), fast_config());
        let schedule = pending("2025-01-01T02:00:00+08:00");
        dispatch.store.upsert_pending(&schedule).unwrap();

        let mut tasks = JoinSet::new();
        assert_eq!(dispatch.dispatch_due(&mut tasks, Utc::now()).unwrap(), 1);
        let joined = tasks.join_next().await.unwrap();
        assert!(joined.unwrap_err().is_panic());
        assert_eq!(dispatch.in_flight(), 0);

        let later = Utc::now()
            + chrono::Duration::from_std(dispatch.executor.config().time_budget()).unwrap()
            + chrono::Duration::seconds(1);
        assert_eq!(dispatch.recover_abandoned(later).await.unwrap(), 1);
        let stored = dispatch.store.get(schedule.schedule_id).unwrap().unwrap();
        assert_eq!(stored.state, ScheduleState::Fired);
    }

    #[tokio::test]
    async fn test_stuck_instance_does_not_block_other_instances() {
        // Transitions never settle, so i-1 stays stopping for the whole test
        let platform = Arc::new(SimulatedPlatform::new(u32::MAX));
        platform.add_instance("i-1", "m5.large");
        platform.add_instance("i-2", "m5.large");
        let dispatch = build(
            platform.clone(),
            ExecutorConfig {
                stop_timeout: Duration::from_secs(60),
                ..fast_config()
            },
        );
        let store = dispatch.store.clone();

        let stuck = pending_for("i-1", "2025-01-01T02:00:00+08:00");
        store.upsert_pending(&stuck).unwrap();
        let mut tasks = JoinSet::new();
        assert_eq!(dispatch.dispatch_due(&mut tasks, Utc::now()).unwrap(), 1);

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let description = platform.describe_instance("i-1").await.unwrap();
                if description.state == InstanceState::Stopping {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("i-1 should start stopping");

        let scheduler = ResizeScheduler::new(
            store.clone(),
            platform.clone(),
            ["i-1", "i-2"],
            FixedOffset::east_opt(0).unwrap(),
        );
        let request = ScheduleRequest {
            instance_id: "i-2".to_string(),
            target_size_class: "m5.2xlarge".to_string(),
            execution_time: "2999-01-01T02:00:00Z".to_string(),
            time_zone: None,
        };
        let scheduled = tokio::time::timeout(
            Duration::from_secs(2),
            scheduler.schedule_at(&request, ScheduleSource::Manual, Utc::now()),
        )
        .await
        .expect("scheduling i-2 should not wait on i-1");
        assert!(scheduled.is_ok());

        let source = Arc::new(StaticMetricsSource::new());
        source.set(
            "i-2",
            Utilization {
                cpu_pct: Some(95.0),
                mem_pct: Some(40.0),
            },
        );
        let check = ScaleCheck::new(platform.clone(), source, scheduler);
        let report = tokio::time::timeout(
            Duration::from_secs(2),
            check.run_at(&managed("i-2"), Utc::now()),
        )
        .await
        .expect("checking i-2 should not wait on i-1")
        .unwrap();
        assert!(report.schedule_id.is_some());

        let still_running = store.get(stuck.schedule_id).unwrap().unwrap();
        assert!(still_running.is_pending());
        assert!(still_running.claimed_at.is_some());
        assert_eq!(dispatch.in_flight(), 1);

        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        assert_eq!(dispatch.in_flight(), 0);
    }
}

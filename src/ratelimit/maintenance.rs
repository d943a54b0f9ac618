//! Background upkeep: health probing and reaping of local state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::config::MaintenanceConfig;

use super::backend::BackendKind;
use super::coordinator::RateLimitCoordinator;

/// How often each maintenance task runs.
#[derive(Debug, Clone, Copy)]
pub struct MaintenanceSchedule {
    pub health_probe_interval: Duration,
    pub counter_reap_interval: Duration,
    pub counter_retention: Duration,
    pub block_reap_interval: Duration,
}

impl From<&MaintenanceConfig> for MaintenanceSchedule {
    fn from(config: &MaintenanceConfig) -> Self {
        Self {
            health_probe_interval: Duration::from_secs(config.health_probe_interval_secs),
            counter_reap_interval: Duration::from_secs(config.counter_reap_interval_secs),
            counter_retention: Duration::from_secs(config.counter_retention_secs),
            block_reap_interval: Duration::from_secs(config.block_reap_interval_secs),
        }
    }
}

/// Handle to the running maintenance tasks.
pub struct Maintenance {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Maintenance {
    /// Spawn the maintenance tasks onto the current runtime.
    pub fn start(coordinator: Arc<RateLimitCoordinator>, schedule: MaintenanceSchedule) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(3);

        if coordinator.has_distributed() {
            let probe = coordinator.clone();
            handles.push(spawn_periodic(
                "health_probe",
                schedule.health_probe_interval,
                rx.clone(),
                move || {
                    let coordinator = probe.clone();
                    async move {
                        if coordinator.active_backend() == BackendKind::Local {
                            coordinator.probe_distributed().await;
                        }
                    }
                },
            ));
        }

        let reaper = coordinator.clone();
        let retention = chrono::Duration::from_std(schedule.counter_retention)
            .unwrap_or_else(|_| chrono::Duration::zero());
        handles.push(spawn_periodic(
            "counter_reaper",
            schedule.counter_reap_interval,
            rx.clone(),
            move || {
                reaper.local().reap_counters(retention);
                async {}
            },
        ));

        let reaper = coordinator;
        handles.push(spawn_periodic(
            "block_reaper",
            schedule.block_reap_interval,
            rx,
            move || {
                reaper.local().reap_blocks();
                async {}
            },
        ));

        info!(tasks = handles.len(), "Maintenance tasks started");
        Self { shutdown, handles }
    }

    /// Stop every task and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        futures::future::join_all(self.handles).await;
        info!("Maintenance tasks stopped");
    }
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                _ = shutdown.changed() => break,
            }
        }
        debug!(task = name, "Maintenance task exiting");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::LimitsConfig;
    use crate::ratelimit::key::LimitKey;

    fn fast_schedule() -> MaintenanceSchedule {
        MaintenanceSchedule {
            health_probe_interval: Duration::from_millis(10),
            counter_reap_interval: Duration::from_millis(10),
            counter_retention: Duration::from_secs(0),
            block_reap_interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_schedule_from_config() {
        let schedule = MaintenanceSchedule::from(&MaintenanceConfig::default());
        assert_eq!(schedule.health_probe_interval, Duration::from_secs(30));
        assert_eq!(schedule.counter_reap_interval, Duration::from_secs(60));
        assert_eq!(schedule.counter_retention, Duration::from_secs(300));
        assert_eq!(schedule.block_reap_interval, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_reapers_remove_expired_state() {
        let clock = ManualClock::starting_now();
        let coordinator = Arc::new(RateLimitCoordinator::new(
            LimitsConfig::default(),
            Arc::new(clock.clone()),
            None,
        ));

        let local = coordinator.local();
        local.check_and_increment(&LimitKey::new("alice", "login"), 10);
        local.block("mallory", "manual", chrono::Duration::minutes(1));

        let maintenance = Maintenance::start(coordinator.clone(), fast_schedule());
        clock.advance(chrono::Duration::minutes(2));
        tokio::time::sleep(Duration::from_millis(100)).await;
        maintenance.shutdown().await;

        assert_eq!(coordinator.local().counter_count(), 0);
        assert!(!coordinator.is_blocked("mallory").await);
    }

    #[tokio::test]
    async fn test_shutdown_stops_tasks() {
        let coordinator = Arc::new(RateLimitCoordinator::new(
            LimitsConfig::default(),
            Arc::new(ManualClock::starting_now()),
            None,
        ));

        let maintenance = Maintenance::start(coordinator, fast_schedule());
        assert_eq!(maintenance.handles.len(), 2);

        tokio::time::timeout(Duration::from_secs(1), maintenance.shutdown())
            .await
            .expect("maintenance did not stop");
    }
}

//! Background maintenance
//!
//! Three periodic routines run on their own timers:
//! - expiry sweep: purge expired messages from every queue
//! - performance aggregation: success rate / latency against configured bounds
//! - heartbeat: flip quiet endpoints to inactive and announce them
//!
//! They are grouped under one [`Maintenance`] supervisor and stopped together
//! through a shared `watch` signal. Routines hold only a `Weak` handle to the
//! broker, so a dropped broker also ends them.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::broker::engine::MessageBroker;
use crate::config::MaintenanceSettings;

#[derive(Debug)]
pub struct Maintenance {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Maintenance {
    pub fn spawn(broker: &Arc<MessageBroker>, settings: &MaintenanceSettings) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let weak = Arc::downgrade(broker);

        let tasks = vec![
            spawn_routine(
                "expiry-sweep",
                Duration::from_millis(settings.expiry_sweep_interval_ms),
                weak.clone(),
                stop_rx.clone(),
                |broker| async move {
                    broker.run_expiry_sweep();
                },
            ),
            spawn_routine(
                "performance",
                Duration::from_millis(settings.performance_interval_ms),
                weak.clone(),
                stop_rx.clone(),
                |broker| async move {
                    broker.run_performance_check();
                },
            ),
            spawn_routine(
                "heartbeat",
                Duration::from_millis(settings.heartbeat_interval_ms),
                weak,
                stop_rx,
                |broker| async move {
                    broker.run_heartbeat_check().await;
                },
            ),
        ];

        Self { stop, tasks }
    }

    /// Signal every routine and wait for all of them to finish.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                debug!("Maintenance routine ended abnormally: {e}");
            }
        }
    }
}

fn spawn_routine<F, Fut>(
    name: &'static str,
    period: Duration,
    broker: Weak<MessageBroker>,
    mut stop: watch::Receiver<bool>,
    routine: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<MessageBroker>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; routines start one period in.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => {
                    let Some(broker) = broker.upgrade() else { break };
                    routine(broker).await;
                }
            }
        }
        debug!("Maintenance routine {name} stopped");
    })
}

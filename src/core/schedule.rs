//! Periodic trigger.

use std::{sync::Arc, time::Duration};

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::cycle::{Cycle, Trigger};

pub struct ScheduleLoop {
    cycle: Arc<Cycle>,
    period: Duration,
}

impl ScheduleLoop {
    pub fn new(cycle: Arc<Cycle>, period: Duration) -> Self {
        Self { cycle, period }
    }

    /// Fires immediately, then every `period` until `cancel`. Each tick runs
    /// its cycle on a separate task so a slow test never delays the timer;
    /// `cancel` also abandons those cycles.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Scheduled speed tests every {:?}", self.period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    debug!("Schedule tick");
                    self.cycle.spawn(Trigger::Schedule, cancel.clone());
                }
            }
        }
        info!("Schedule loop stopped");
    }
}

//! The cron collector: fires on a 5-field schedule.

use std::{str::FromStr, sync::Arc};

use chrono::{DateTime, Local};
use cron::Schedule;
use metron_common::{
    Component, ConfigError, Signal, WorkerComponent, config::ComponentConfig, wait_shutdown,
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::CollectorCore;

/// Parses a 5-field cron schedule (minute, hour, day-of-month, month,
/// day-of-week); the seconds field is pinned to zero.
pub fn parse_schedule(text: &str) -> Result<Schedule, String> {
    let fields = text.split_whitespace().count();
    if fields != 5 {
        return Err(format!("expected 5 fields, found {fields}"));
    }
    Schedule::from_str(&format!("0 {text}")).map_err(|e| e.to_string())
}

pub struct CronCollector {
    core: Arc<CollectorCore>,
    schedule: Schedule,
}

impl CronCollector {
    pub fn from_config(
        config: &ComponentConfig,
        core: Arc<CollectorCore>,
    ) -> Result<Self, ConfigError> {
        let schedule = config.str_value("schedule")?;
        let schedule = parse_schedule(&schedule).map_err(|message| {
            ConfigError::invalid(
                format!("{}.schedule", config.id()),
                format!("the schedule '{schedule}' is not valid: {message}"),
            )
        })?;
        info!(name = %core.id(), "the cron schedule is {}", config.str_value("schedule")?);
        Ok(Self { core, schedule })
    }

    pub fn core(&self) -> &Arc<CollectorCore> {
        &self.core
    }

    async fn serve(self: Arc<Self>, mut shutdown: broadcast::Receiver<Signal>) {
        let mut previous: DateTime<Local> = Local::now();
        loop {
            // the next fire time is always strictly after the previous one
            let Some(next) = self.schedule.after(&previous).next() else {
                error!(name = %self.core.id(), "the schedule yields no further fire times");
                break;
            };
            previous = next;

            let wait = next - Local::now();
            let Ok(wait) = wait.to_std() else {
                // overrun or clock skew: this slot already passed
                warn!(
                    name = %self.core.id(),
                    "the next run of the job already passed by {} seconds, \
                     trying the next iteration",
                    -wait.num_seconds()
                );
                continue;
            };

            debug!(
                name = %self.core.id(),
                "the next job will run at {next} (in {} seconds)",
                wait.as_secs()
            );
            if wait_shutdown(&mut shutdown, wait).await {
                break;
            }

            info!(name = %self.core.id(), "running the job");
            let core = Arc::clone(&self.core);
            // shaping may call into blocking providers; jobs on one
            // collector never overlap because the loop awaits each one
            if let Err(e) = tokio::task::spawn_blocking(move || core.collect(None)).await {
                // a panicked job is a programmer error; the loop continues
                error!(name = %self.core.id(), critical = true, "the job failed due to {e}");
            }
        }
        debug!(name = %self.core.id(), "the cron worker ended");
    }
}

impl Component for CronCollector {
    fn id(&self) -> &str {
        self.core.id()
    }
}

impl WorkerComponent for CronCollector {
    fn start(self: Arc<Self>, shutdown: broadcast::Receiver<Signal>) -> JoinHandle<()> {
        self.core.log_start("cron");
        tokio::spawn(self.serve(shutdown))
    }
}

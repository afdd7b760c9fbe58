//! Runs registered experiments one after another.
//!
//! For every registration the scheduler connects its server group, runs the
//! experiment until it stops asking for a restart, disconnects, and records a
//! checkpoint entry. Experiments never overlap; commands inside one experiment
//! may run concurrently across servers.

use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::checkpoint::Checkpoint;
use crate::config::ControllerConfig;
use crate::controller::RemoteExit;
use crate::error::DistexpError;
use crate::notification::{Notifier, Silent, Slack};
use crate::registry::{Action, Registration, Registry};

const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    /// Registrations in the batch.
    pub experiments: usize,
    /// Registrations skipped because the checkpoint already had them.
    pub skipped: usize,
    pub elapsed: Duration,
}

pub struct Scheduler {
    registry: Registry,
    checkpoint: Checkpoint,
    resume: bool,
    notifier: Box<dyn Notifier>,
    restart_delay: Duration,
}

impl Scheduler {
    pub fn new(registry: Registry, checkpoint: Checkpoint) -> Self {
        Self {
            registry,
            checkpoint,
            resume: false,
            notifier: Box::new(Silent),
            restart_delay: DEFAULT_RESTART_DELAY,
        }
    }

    /// Builds a scheduler from controller command line flags.
    pub fn from_config(registry: Registry, config: &ControllerConfig) -> Result<Self, DistexpError> {
        let checkpoint = Checkpoint::open(&config.checkpoint_file)?;
        let scheduler = Self::new(registry, checkpoint).resume(config.resume);
        Ok(match &config.slack_webhook {
            Some(url) => scheduler.notifier(Slack::new(url.as_str())),
            None => scheduler,
        })
    }

    /// Skip registrations the checkpoint already lists.
    pub fn resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn notifier(mut self, notifier: impl Notifier + 'static) -> Self {
        self.notifier = Box::new(notifier);
        self
    }

    /// Pause before re-running an experiment that asked for a restart.
    pub fn restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Runs the whole batch.
    ///
    /// Returns the first batch-halting error. In that case the checkpoint
    /// keeps every experiment finished so far, for a later `resume`.
    pub async fn run(&mut self) -> Result<BatchSummary, DistexpError> {
        if !self.resume {
            self.checkpoint.reset()?;
        }
        let total = self.registry.len();
        info!("Total experiments: {}", total);

        let started = Instant::now();
        let mut skipped = 0;
        let registrations: Vec<Registration> = self.registry.iter().cloned().collect();
        for (i, registration) in registrations.iter().enumerate() {
            if self.resume
                && self
                    .checkpoint
                    .was_run(&registration.function, &registration.params)?
            {
                info!(
                    "Experiment {}/{} ({}) was already run.",
                    i + 1,
                    total,
                    registration.name
                );
                skipped += 1;
                continue;
            }
            info!("Running experiment {}/{} ({})", i + 1, total, registration.name);
            if let Err(e) = self.run_one(registration).await {
                error!("Experiment {} halted the batch: {}", registration.name, e);
                return Err(e);
            }
        }

        let elapsed = started.elapsed();
        info!("Finished {} experiments in {}", total, format_duration(elapsed));
        self.checkpoint.reset()?;
        if let Err(e) = self.notifier.on_finish(total, elapsed).await {
            warn!("Failed to send finish notification: {}", e);
        }
        Ok(BatchSummary {
            experiments: total,
            skipped,
            elapsed,
        })
    }

    /// Runs one registration. Errors returned from here halt the batch.
    async fn run_one(&mut self, registration: &Registration) -> Result<(), DistexpError> {
        let (exit_tx, exit_rx) = flume::unbounded();
        registration
            .servers
            .connect_reporting(Some(exit_tx))
            .await?;

        let started = Instant::now();
        let outcome = self.attempts(registration, &exit_rx).await;
        // Commands still running are killed by the agents once we hang up.
        registration.servers.disconnect_all().await;

        if !registration.policy.raise_on_rc {
            for exit in exit_rx.drain() {
                warn!(
                    "{}: {:?} exited with return code {}",
                    exit.server, exit.command, exit.code
                );
            }
        }
        match outcome {
            Ok(()) => info!(
                "Experiment {} finished in {:.4} seconds.",
                registration.name,
                started.elapsed().as_secs_f64()
            ),
            Err(e) if !e.halts_batch(registration.policy.raise_on_rc) => {
                warn!("Experiment {} failed, continuing: {}", registration.name, e)
            }
            Err(e) => return Err(e),
        }
        self.checkpoint
            .add_run(&registration.function, &registration.params)
    }

    /// The attempt loop. With `raise_on_rc`, the first nonzero exit reported
    /// on any connection ends the experiment with an error.
    async fn attempts(
        &self,
        registration: &Registration,
        exits: &flume::Receiver<RemoteExit>,
    ) -> Result<(), DistexpError> {
        let policy = registration.policy;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let run = registration
                .experiment
                .run(registration.servers.clone(), registration.params.clone());
            let action = if policy.raise_on_rc {
                // The experiment is dropped when an exit wins. Its remote
                // commands keep running until the group disconnects.
                let action = tokio::select! {
                    result = run => result?,
                    Ok(exit) = exits.recv_async() => return Err(exit.into()),
                };
                if let Ok(exit) = exits.try_recv() {
                    return Err(exit.into());
                }
                action
            } else {
                run.await?
            };

            match action {
                Action::Continue => return Ok(()),
                Action::Restart if policy.max_restarts != 0 && attempt >= policy.max_restarts => {
                    warn!(
                        "Experiment {} still asked for a restart after {} attempts, moving on",
                        registration.name, attempt
                    );
                    return Ok(());
                }
                Action::Restart => {
                    info!("Restarting experiment {}", registration.name);
                    tokio::time::sleep(self.restart_delay).await;
                }
            }
        }
    }
}

/// `HH:MM:SS.ssss`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = (secs % 60) as f64 + f64::from(duration.subsec_nanos()) / 1e9;
    format!("{:02}:{:02}:{:07.4}", hours, minutes, seconds)
}

use std::sync::Arc;

use sqlshift_common::Result;
use sqlshift_config::{AppConfig, Environment};
use tracing::{error, info};

use crate::database::Database;
use crate::runner::{RunReport, Runner};

/// What the startup hook did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Disabled,
    UpToDate,
    Applied(RunReport),
}

/// How a failed startup migration is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Terminate the process; the application must not serve traffic against
    /// a schema that may be stale.
    Exit,
    Propagate,
}

/// Runs pending migrations when the application boots, if enabled.
pub struct StartupHook {
    runner: Runner,
    enabled: bool,
    environment: Environment,
}

impl StartupHook {
    pub fn new(runner: Runner, enabled: bool, environment: Environment) -> Self {
        Self {
            runner,
            enabled,
            environment,
        }
    }

    pub fn from_config(db: Arc<Database>, config: &AppConfig) -> Result<Self> {
        let runner = Runner::from_config(db, &config.migrations)?;
        Ok(Self::new(
            runner,
            config.migrations.auto_run,
            config.environment,
        ))
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        if self.environment.is_production() {
            FailurePolicy::Exit
        } else {
            FailurePolicy::Propagate
        }
    }

    pub fn run(&self) -> Result<HookOutcome> {
        if !self.enabled {
            info!("automatic migrations disabled");
            return Ok(HookOutcome::Disabled);
        }

        let pending = self.runner.check_pending()?;
        if pending.is_empty() {
            info!("startup migration check: schema is up to date");
            return Ok(HookOutcome::UpToDate);
        }

        info!(
            "startup migration check: {} pending ({})",
            pending.len(),
            pending.join(", ")
        );
        let report = self.runner.run_migrations()?;
        Ok(HookOutcome::Applied(report))
    }

    /// Like [`run`](Self::run), but in production a failure ends the process
    /// with exit code 1 instead of returning.
    pub fn run_or_exit(&self) -> Result<HookOutcome> {
        match self.run() {
            Ok(outcome) => Ok(outcome),
            Err(e) => match self.failure_policy() {
                FailurePolicy::Exit => {
                    error!(
                        environment = %self.environment,
                        "startup migrations failed, refusing to start: {e}"
                    );
                    std::process::exit(1);
                }
                FailurePolicy::Propagate => {
                    error!(environment = %self.environment, "startup migrations failed: {e}");
                    Err(e)
                }
            },
        }
    }
}

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlshift_config::{AppConfig, ConfigLoader};
use sqlshift_db::{Database, HookOutcome, Runner, StartupHook};
use tracing::warn;

use crate::report;
use crate::{Cli, Command};

pub async fn dispatch(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let timeout = cli.timeout.map(Duration::from_secs);
    let db = Arc::new(open_database(&config)?);

    match cli.command {
        Command::CheckPending { json } => {
            let runner = Runner::from_config(Arc::clone(&db), &config.migrations)?;
            let pending = run_blocking(&db, timeout, move || runner.check_pending()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&pending)?);
            } else {
                print!("{}", report::render_pending(&pending));
            }
        }
        Command::Run => {
            let runner = Runner::from_config(Arc::clone(&db), &config.migrations)?;
            let applied = run_blocking(&db, timeout, move || runner.run_migrations()).await?;
            print!("{}", report::render_run(&applied));
        }
        Command::Status { json } => {
            let runner = Runner::from_config(Arc::clone(&db), &config.migrations)?;
            let statuses = run_blocking(&db, timeout, move || runner.status()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else {
                print!("{}", report::render_status(&statuses));
            }
        }
        Command::Unlock => {
            let runner = Runner::from_config(Arc::clone(&db), &config.migrations)?;
            if runner.force_unlock()? {
                println!("migration lock released");
            } else {
                println!("no migration lock held");
            }
        }
        Command::Startup => {
            let hook = StartupHook::from_config(Arc::clone(&db), &config)?;
            let outcome = run_blocking(&db, timeout, move || hook.run_or_exit()).await?;
            match outcome {
                HookOutcome::Disabled => println!("automatic migrations disabled"),
                HookOutcome::UpToDate => print!("{}", report::render_pending(&[])),
                HookOutcome::Applied(applied) => print!("{}", report::render_run(&applied)),
            }
        }
        #[cfg(feature = "reset")]
        Command::Reset { mode, yes } => reset(&db, &config, mode, yes)?,
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = ConfigLoader::new(cli.config.clone())
        .load()
        .context("failed to load configuration")?;

    if let Some(path) = &cli.database {
        config.database.path = path.clone();
    }
    if let Some(dir) = &cli.migrations_dir {
        config.migrations.dir = dir.clone();
    }
    Ok(config)
}

fn open_database(config: &AppConfig) -> Result<Database> {
    let path = &config.database.path;
    if path.as_os_str() != ":memory:"
        && let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty())
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    Database::from_config(&config.database)
        .with_context(|| format!("failed to open database {}", path.display()))
}

/// Run blocking engine work off the async runtime. Ctrl-C or the deadline
/// cancels it; the engine rolls back its open transaction before returning.
async fn run_blocking<T, F>(db: &Database, timeout: Option<Duration>, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> sqlshift_common::Result<T> + Send + 'static,
{
    let cancel = db.cancel_handle();
    let mut task = tokio::task::spawn_blocking(work);
    let deadline = deadline(timeout);
    tokio::pin!(deadline);

    let joined = tokio::select! {
        joined = &mut task => joined,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupt received, cancelling migration run");
            cancel.cancel();
            task.await
        }
        _ = &mut deadline => {
            warn!("timed out after {}s, cancelling migration run", timeout.unwrap_or_default().as_secs());
            cancel.cancel();
            task.await
        }
    };

    Ok(joined.context("migration task panicked")??)
}

fn deadline(timeout: Option<Duration>) -> impl Future<Output = ()> {
    async move {
        match timeout {
            Some(after) => tokio::time::sleep(after).await,
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(feature = "reset")]
pub fn parse_reset_mode(s: &str) -> std::result::Result<sqlshift_db::ResetMode, String> {
    s.parse().map_err(|e: sqlshift_common::Error| e.to_string())
}

#[cfg(feature = "reset")]
fn reset(
    db: &Arc<Database>,
    config: &AppConfig,
    mode: sqlshift_db::ResetMode,
    yes: bool,
) -> Result<()> {
    use sqlshift_db::{Ledger, Reset};

    if config.environment.is_production() {
        anyhow::bail!("reset is disabled when environment is production");
    }
    if !yes && !crate::confirm::confirm_reset(mode, &config.database.path)? {
        println!("reset aborted");
        return Ok(());
    }

    let ledger = Ledger::new(&config.migrations.table)?;
    Reset::new(Arc::clone(db), ledger).execute(mode)?;
    tracing::info!("reset completed: {mode}");
    println!("reset completed: {mode}");
    Ok(())
}

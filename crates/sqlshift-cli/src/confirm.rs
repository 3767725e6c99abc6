use std::io::IsTerminal;
use std::path::Path;

use anyhow::{Context, Result};
use dialoguer::Confirm;
use sqlshift_db::ResetMode;

/// Ask before destroying anything. Non-interactive sessions must pass `--yes`.
pub fn confirm_reset(mode: ResetMode, db_path: &Path) -> Result<bool> {
    if !std::io::stdin().is_terminal() {
        anyhow::bail!("refusing to run `reset --mode {mode}` non-interactively without --yes");
    }

    let what = match mode {
        ResetMode::ResetOnly => "clear the migration ledger",
        ResetMode::DropAll => "drop every managed table, view, index and trigger",
        ResetMode::FullReset => "drop every managed object and clear the ledger",
    };

    Confirm::new()
        .with_prompt(format!("This will {what} in {}. Continue?", db_path.display()))
        .default(false)
        .interact()
        .context("confirmation cancelled")
}

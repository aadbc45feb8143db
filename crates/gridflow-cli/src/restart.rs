use eyre::{eyre, Context, Result};
use gridflow_core::config;
use gridflow_core::restart::{FileRestartInfo, FileRestartInfoIdentifier, FileRestartManager, RestartManager, RestartType};

use crate::cli::{Direction, RestartCommand, ShowArgs};

pub fn run(command: &RestartCommand) -> Result<()> {
    let dir = config::restart_dir()?;
    let store = FileRestartManager::new(&dir).wrap_err_with(|| format!("opening {}", dir.display()))?;
    match command {
        RestartCommand::List => {
            let records = store.list()?;
            if records.is_empty() {
                println!("No checkpoints in {}", dir.display());
            }
            for info in &records {
                println!("{}", describe(info));
            }
        }
        RestartCommand::Show(args) => println!("{}", show(&store, args)?),
        RestartCommand::Clear => {
            let removed = store.clear()?;
            println!("Removed {removed} checkpoint(s) from {}", dir.display());
        }
    }
    Ok(())
}

fn show(store: &FileRestartManager, args: &ShowArgs) -> Result<String> {
    let restart_type = match args.direction {
        Direction::Put => RestartType::Put,
        Direction::Get => RestartType::Get,
    };
    let id = FileRestartInfoIdentifier::new(args.account.clone(), args.remote.clone(), restart_type);
    let info = store
        .retrieve_restart(&id)?
        .ok_or_else(|| eyre!("no checkpoint for {id}"))?;
    Ok(serde_json::to_string_pretty(&info)?)
}

fn describe(info: &FileRestartInfo) -> String {
    let (arrow, direction) = match info.restart_type {
        RestartType::Put => ("<-", "PUT"),
        RestartType::Get => ("->", "GET"),
    };
    let confirmed = info.estimate_length_so_far().min(info.file_size);
    let percent = if info.file_size == 0 {
        100.0
    } else {
        confirmed as f64 * 100.0 / info.file_size as f64
    };
    format!(
        "{direction} {} {arrow} {} [{}] {confirmed}/{} bytes ({percent:.1}%), {} attempt(s)",
        info.irods_absolute_path,
        info.local_absolute_path.display(),
        info.account_identifier,
        info.file_size,
        info.restart_attempts
    )
}

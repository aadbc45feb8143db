use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver};
use eyre::{bail, eyre, Context, Result};
use gridflow_core::config::{self, TransferProperties};
use gridflow_core::restart::FileRestartManager;
use gridflow_core::status::{CallbackResponse, ChannelStatusListener, TransferState, TransferStatus};
use gridflow_core::{ForceOption, NegotiatedSession, ParallelFileTransfer, TransferControlBlock, TransferOptions};
use indicatif::{ProgressBar, ProgressStyle};

use crate::cli::{EndpointArgs, GetArgs, PutArgs, TransferFlags};

pub fn run_put(args: &PutArgs) -> Result<()> {
    if !args.local.is_file() {
        bail!("source file does not exist: {}", args.local.display());
    }
    let total = std::fs::metadata(&args.local)
        .with_context(|| format!("reading {}", args.local.display()))?
        .len();
    let label = format!("Sending {} → {}", args.local.display(), args.remote);
    run_transfer(&args.endpoint, &args.flags, ForceOption::UseForce, total, &label, |transfer| {
        transfer.put(&args.local, &args.remote)
    })
}

pub fn run_get(args: &GetArgs) -> Result<()> {
    let force = if args.force {
        ForceOption::UseForce
    } else {
        ForceOption::NoForce
    };
    let label = format!("Receiving {} → {}", args.remote, args.local.display());
    run_transfer(&args.endpoint, &args.flags, force, args.length, &label, |transfer| {
        transfer.get(&args.remote, &args.local, args.length)
    })
}

fn run_transfer<F>(
    endpoint: &EndpointArgs,
    flags: &TransferFlags,
    force: ForceOption,
    total: u64,
    label: &str,
    operation: F,
) -> Result<()>
where
    F: FnOnce(&ParallelFileTransfer) -> gridflow_core::TransferResult<()>,
{
    let mut properties = TransferProperties::load_or_default()?;
    if flags.restart {
        properties.long_transfer_restart = true;
    }
    let session = build_session(endpoint, &properties)?;
    log::debug!("{label} over {session:?}");

    let control = Arc::new(TransferControlBlock::default());
    control.set_transfer_options(Some(TransferOptions {
        intra_file_status_callbacks: true,
        intra_file_status_calls_interval: properties.intra_file_status_calls_interval,
        intra_file_status_bytes_interval: properties.intra_file_status_bytes_interval,
        abandon_siblings_on_failure: flags.fail_fast,
        force_option: force,
    }));

    let (tx, rx) = unbounded();
    let listener = Arc::new(ChannelStatusListener::new(tx, CallbackResponse::NoThisFile));
    let progress = progress_bar(flags.progress, total, label);
    let watcher = watch(rx, progress.clone());

    let mut transfer = ParallelFileTransfer::new(session, properties.clone(), Arc::clone(&control)).with_listener(listener);
    if properties.long_transfer_restart {
        let store = FileRestartManager::new(config::restart_dir()?).wrap_err("opening restart store")?;
        transfer = transfer.with_restart_manager(flags.account.clone(), Arc::new(store));
    }

    let start = Instant::now();
    let result = operation(&transfer);
    // The watcher drains until every listener handle is gone.
    drop(transfer);
    let outcome = watcher.join().map_err(|_| eyre!("progress watcher panicked"))?;
    progress.finish_and_clear();
    result.wrap_err("parallel transfer failed")?;

    if let Some(message) = outcome.failure {
        if flags.restart {
            eprintln!("{}", checkpoint_note(&config::restart_dir()?));
        }
        bail!("transfer failed: {message}");
    }
    if outcome.cancelled {
        bail!("transfer cancelled");
    }
    if outcome.skipped {
        println!("Skipped: target exists (use --force to overwrite).");
        return Ok(());
    }

    let elapsed = start.elapsed();
    println!(
        "Transferred {} in {:.2?} ({}/s) over {} sockets",
        format_bytes(total),
        elapsed,
        format_bytes(throughput(total, elapsed)),
        endpoint.threads
    );
    Ok(())
}

/// Nothing here can reach the grid file directly, so the next run starts over.
fn checkpoint_note(restart_dir: &Path) -> String {
    format!(
        "A checkpoint was kept in {}; the next run sends the whole file again. \
         Inspect it with 'gridflow restart list' or remove it with 'gridflow restart clear'.",
        restart_dir.display()
    )
}

pub(crate) fn build_session(endpoint: &EndpointArgs, properties: &TransferProperties) -> Result<NegotiatedSession> {
    let session = NegotiatedSession::plain(endpoint.host.clone(), endpoint.port, endpoint.threads, endpoint.cookie);
    let session = if endpoint.ssl {
        let secret = endpoint
            .secret
            .as_ref()
            .ok_or_else(|| eyre!("--ssl needs the negotiated --secret"))?;
        session.with_encryption(secret.as_bytes().to_vec(), properties.cipher.clone())
    } else {
        session
    };
    session.validate().wrap_err("invalid endpoint")?;
    Ok(session)
}

fn progress_bar(enabled: bool, total: u64, label: &str) -> ProgressBar {
    if !enabled {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    if let Ok(style) =
        ProgressStyle::with_template("{msg}\n{bar:40} {bytes}/{total_bytes} {bytes_per_sec} eta {eta}")
    {
        pb.set_style(style);
    }
    pb.set_message(label.to_string());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

#[derive(Debug, Default)]
struct Outcome {
    failure: Option<String>,
    cancelled: bool,
    skipped: bool,
}

fn watch(rx: Receiver<TransferStatus>, progress: ProgressBar) -> JoinHandle<Outcome> {
    thread::spawn(move || {
        let mut outcome = Outcome::default();
        for status in rx.iter() {
            apply(&mut outcome, &progress, &status);
        }
        outcome
    })
}

fn apply(outcome: &mut Outcome, progress: &ProgressBar, status: &TransferStatus) {
    if status.intra_file {
        progress.set_position(status.bytes_transferred);
        return;
    }
    match status.state {
        TransferState::Failure => {
            let message = status
                .exception
                .as_ref()
                .map(|fault| fault.to_string())
                .unwrap_or_else(|| "unknown failure".to_string());
            outcome.failure.get_or_insert(message);
        }
        TransferState::Cancelled => outcome.cancelled = true,
        TransferState::Skipping => outcome.skipped = true,
        TransferState::Restarting => progress.set_message(format!("Resuming {}", status.source_absolute_path)),
        TransferState::Success => progress.set_position(status.total_size),
        _ => {}
    }
}

fn throughput(bytes: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs <= f64::EPSILON {
        return bytes;
    }
    (bytes as f64 / secs) as u64
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridflow_core::status::TransferType;
    use gridflow_core::TransferFault;

    fn endpoint(ssl: bool, secret: Option<&str>) -> EndpointArgs {
        EndpointArgs {
            host: "grid.example".into(),
            port: 20000,
            cookie: 7,
            threads: 4,
            ssl,
            secret: secret.map(str::to_string),
        }
    }

    #[test]
    fn session_from_endpoint() {
        let props = TransferProperties::default();
        let session = build_session(&endpoint(false, None), &props).unwrap();
        assert_eq!(session.address(), "grid.example:20000");
        assert!(!session.ssl_negotiated);

        let session = build_session(&endpoint(true, Some("s3cret")), &props).unwrap();
        assert!(session.ssl_negotiated);
        assert!(build_session(&endpoint(true, None), &props).is_err());
    }

    #[test]
    fn rejects_too_many_threads() {
        let mut args = endpoint(false, None);
        args.threads = 64;
        assert!(build_session(&args, &TransferProperties::default()).is_err());
    }

    #[test]
    fn failure_status_is_recorded_once() {
        let mut outcome = Outcome::default();
        let progress = ProgressBar::hidden();
        for remaining in [3, 9] {
            let status = TransferStatus::for_exception(
                TransferType::Get,
                "/zone/a",
                "/tmp/a",
                "",
                10,
                0,
                Default::default(),
                TransferFault::Stalled { remaining },
            )
            .unwrap();
            apply(&mut outcome, &progress, &status);
        }
        assert!(outcome.failure.unwrap().contains("3 bytes"));
    }

    #[test]
    fn checkpoint_note_does_not_promise_resume() {
        let note = checkpoint_note(Path::new("/home/rods/.config/gridflow/restart"));
        assert!(note.contains("/home/rods/.config/gridflow/restart"), "{note}");
        assert!(note.contains("sends the whole file again"), "{note}");
        assert!(note.contains("gridflow restart clear"), "{note}");
        assert!(!note.contains("resume"), "{note}");
    }

    #[test]
    fn byte_formatting() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MiB");
    }
}

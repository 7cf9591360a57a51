use anyhow::{bail, Context, Result};
use chrono::{Duration, Local, NaiveDateTime};
use rce_server::records::HEARTBEAT_FORMAT;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const USAGE: &str =
    "Usage: rce-watchdog <heartbeat file> [timeout_secs] [check_secs] [-- <command> [args..]]";

/// Pause before a supervised command is started again.
const RESTART_DELAY: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Debug, PartialEq)]
struct Args {
    heartbeat: PathBuf,
    timeout_secs: i64,
    check_secs: i64,
    command: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
enum Liveness {
    Alive { age: Duration },
    Stale { age: Duration },
    Missing,
    Garbled(String),
}

impl Liveness {
    fn is_alive(&self) -> bool {
        matches!(self, Liveness::Alive { .. })
    }
}

fn assess(content: Option<&str>, now: NaiveDateTime, timeout: Duration) -> Liveness {
    let Some(content) = content else {
        return Liveness::Missing;
    };
    let line = content.trim();
    match NaiveDateTime::parse_from_str(line, HEARTBEAT_FORMAT) {
        Ok(beat) => {
            let age = now - beat;
            if age > timeout {
                Liveness::Stale { age }
            } else {
                Liveness::Alive { age }
            }
        }
        Err(_) => Liveness::Garbled(line.to_string()),
    }
}

async fn read_heartbeat(path: &Path) -> Option<String> {
    tokio::fs::read_to_string(path).await.ok()
}

fn report(path: &Path, liveness: &Liveness, was_alive: Option<bool>) {
    let changed = was_alive != Some(liveness.is_alive());
    match liveness {
        Liveness::Alive { age } if changed => {
            info!(file = %path.display(), age_secs = age.num_seconds(), "controller ONLINE")
        }
        Liveness::Alive { age } => info!(age_secs = age.num_seconds(), "heartbeat ok"),
        Liveness::Stale { age } => error!(
            file = %path.display(),
            age_secs = age.num_seconds(),
            "controller OFFLINE: heartbeat stale"
        ),
        Liveness::Missing => {
            error!(file = %path.display(), "controller OFFLINE: no heartbeat file")
        }
        Liveness::Garbled(line) => {
            error!(file = %path.display(), %line, "controller OFFLINE: unreadable heartbeat")
        }
    }
}

fn parse_secs(arg: Option<&String>, default: i64) -> Result<i64> {
    match arg {
        None => Ok(default),
        Some(raw) => {
            let secs: i64 = raw.parse().with_context(|| format!("bad seconds {raw:?}"))?;
            if secs <= 0 {
                bail!("seconds must be positive, got {secs}");
            }
            Ok(secs)
        }
    }
}

fn parse_args(raw: &[String]) -> Result<Args> {
    let (own, command) = match raw.iter().position(|a| a == "--") {
        Some(split) => (&raw[..split], Some(raw[split + 1..].to_vec())),
        None => (raw, None),
    };
    if command.as_ref().is_some_and(|c| c.is_empty()) {
        bail!("missing command after --\n{}", USAGE);
    }
    let Some(heartbeat) = own.first().map(PathBuf::from) else {
        bail!(USAGE);
    };
    if own.len() > 3 {
        bail!(USAGE);
    }
    Ok(Args {
        heartbeat,
        // Two missed 15-minute cycles by default.
        timeout_secs: parse_secs(own.get(1), 30 * 60)?,
        check_secs: parse_secs(own.get(2), 60)?,
        command,
    })
}

/// Runs `command` to completion; `None` when it was killed by a signal.
async fn run_child(command: &[String]) -> Result<Option<i32>> {
    let Some((program, args)) = command.split_first() else {
        bail!("empty command");
    };
    let status = tokio::process::Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .status()
        .await
        .with_context(|| format!("starting {program}"))?;
    Ok(status.code())
}

/// Keeps `command` running, restarting it `delay` after every exit.
/// Returns after `runs` starts when a limit is given.
async fn supervise(command: Vec<String>, delay: std::time::Duration, runs: Option<usize>) -> usize {
    let mut started = 0;
    loop {
        info!(command = ?command, "starting supervised process");
        started += 1;
        match run_child(&command).await {
            Ok(Some(code)) => warn!(code, "supervised process exited"),
            Ok(None) => warn!("supervised process killed by signal"),
            Err(e) => error!("{:#}", e),
        }
        if runs.is_some_and(|limit| started >= limit) {
            return started;
        }
        info!(delay_secs = delay.as_secs(), "restarting");
        tokio::time::sleep(delay).await;
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let raw: Vec<String> = std::env::args().skip(1).collect();
    let Args {
        heartbeat: path,
        timeout_secs,
        check_secs: check,
        command,
    } = parse_args(&raw)?;
    let timeout = Duration::seconds(timeout_secs);
    info!(
        file = %path.display(),
        timeout_secs,
        check_secs = check,
        "watching heartbeat"
    );
    if let Some(command) = command {
        tokio::spawn(supervise(command, RESTART_DELAY, None));
    }

    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(check as u64));
    let mut was_alive = None;
    loop {
        ticker.tick().await;
        let content = read_heartbeat(&path).await;
        let liveness = assess(content.as_deref(), Local::now().naive_local(), timeout);
        report(&path, &liveness, was_alive);
        if was_alive == Some(true) && !liveness.is_alive() {
            warn!("controller stopped reporting");
        }
        was_alive = Some(liveness.is_alive());
    }
}

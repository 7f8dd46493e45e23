//! `drake`: run a scripted host session against the stub engine.
//!
//! ```text
//! drake [--settings PATH] SCRIPT.json
//! ```
//!
//! Prints the session report as JSON on stdout and exits non-zero if any step
//! failed.

mod scenario;
mod settings;

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{bail, Context};
use scenario::{Script, Session};
use settings::{default_settings_path, load_settings, log_path, save_settings, HostSettings};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

struct Args {
    settings: PathBuf,
    script: PathBuf,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut settings = None;
    let mut script = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--settings" => {
                let path = args.next().context("--settings needs a path")?;
                settings = Some(PathBuf::from(path));
            }
            "-h" | "--help" => bail!("usage: drake [--settings PATH] SCRIPT.json"),
            other if script.is_none() => script = Some(PathBuf::from(other)),
            other => bail!("unexpected argument {other}"),
        }
    }
    Ok(Args {
        settings: settings.unwrap_or_else(default_settings_path),
        script: script.context("usage: drake [--settings PATH] SCRIPT.json")?,
    })
}

fn init_tracing(settings: &HostSettings) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("drake=info"));
    if settings.debug_log {
        let path = log_path();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

fn run() -> anyhow::Result<bool> {
    let args = parse_args()?;
    let settings = load_settings(&args.settings);
    init_tracing(&settings)?;
    info!(settings = %args.settings.display(), "drake host starting");
    if !args.settings.exists() {
        if let Err(e) = save_settings(&args.settings, &settings) {
            warn!("could not write default settings: {e}");
        }
    }

    let raw = fs::read_to_string(&args.script)
        .with_context(|| format!("reading {}", args.script.display()))?;
    let script: Script = serde_json::from_str(&raw)
        .with_context(|| format!("parsing {}", args.script.display()))?;

    let report = Session::install(settings.shim_config())?.run(&script);
    println!("{}", serde_json::to_string_pretty(&report)?);

    let failures = report.failures();
    info!(steps = report.outcomes.len(), failures, "session finished");
    Ok(failures == 0)
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e:#}");
            eprintln!("drake: {e:#}");
            ExitCode::from(2)
        }
    }
}

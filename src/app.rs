use crate::config::{DriverConfig, DriverMode};
use crate::driver::Driver;
use crate::observability::{DriverLog, JsonLineLogger, LogLevel, LogRotationPolicy, LogSink};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::env;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

const USAGE: &str = "usage: finbench-driver [--config <path>] [--mode <mode>] [--set key=value]...";

#[derive(Debug, Default)]
struct CliArgs {
    config: Option<PathBuf>,
    mode: Option<String>,
    overrides: Vec<String>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<CliArgs> {
    let mut parsed = CliArgs::default();
    while let Some(arg) = args.next() {
        let mut value = |flag: &str| {
            args.next()
                .with_context(|| format!("{flag} needs a value\n{USAGE}"))
        };
        match arg.as_str() {
            "--config" | "-c" => parsed.config = Some(PathBuf::from(value("--config")?)),
            "--mode" | "-m" => parsed.mode = Some(value("--mode")?),
            "--set" | "-s" => parsed.overrides.push(value("--set")?),
            "--help" | "-h" => bail!("{USAGE}"),
            other => bail!("unexpected argument '{other}'\n{USAGE}"),
        }
    }
    Ok(parsed)
}

fn load_config(args: &CliArgs) -> Result<DriverConfig> {
    let mut config = match &args.config {
        Some(path) => DriverConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => DriverConfig::default(),
    };
    if let Some(mode) = &args.mode {
        config.mode = mode.parse()?;
    }
    config
        .apply_overrides(args.overrides.iter().map(String::as_str))
        .context("failed to apply overrides")?;
    config.validate()?;
    Ok(config)
}

fn open_log(config: &DriverConfig) -> Result<DriverLog> {
    let sink = match &config.log_file {
        Some(path) => LogSink::File(path.clone()),
        None => LogSink::Stderr,
    };
    let logger = JsonLineLogger::new(sink, LogRotationPolicy::default())
        .context("failed to open driver log")?;
    let run_id = format!("{}-{}", config.name, epoch_ms());
    let log = DriverLog::new(logger, "app", &run_id);
    log.set_level(config.log_level());
    Ok(log)
}

fn epoch_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or(0)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Loads the configuration named on the command line and runs the selected
/// mode. Fails when the run fails or its results do not validate.
pub fn run() -> Result<()> {
    let args = parse_args(env::args().skip(1))?;
    let config = load_config(&args)?;
    let log = open_log(&config)?;
    log.event(LogLevel::Info, "configuration loaded", config.to_value());
    let mode = config.mode;
    let driver = Driver::new(config, log);
    match mode {
        DriverMode::Execute => {
            let outcome = driver.run_once()?;
            print_json(&outcome)?;
            if let Some(failure) = &outcome.error_state {
                bail!("run failed: {failure}");
            }
            if !outcome.passed() {
                bail!("run did not pass delay validation");
            }
        }
        DriverMode::Tune => {
            let report = driver.tune()?;
            print_json(&report)?;
            if report.best_ratio.is_none() {
                bail!("no compression ratio passed validation");
            }
        }
        DriverMode::ValidateResults => {
            let audit = driver.validate_results()?;
            print_json(&audit)?;
            if !audit.validation.passed() {
                bail!("{}", audit.validation.audit_message());
            }
        }
        DriverMode::ValidateDatabase => {
            let report = driver.validate_database()?;
            print_json(&report)?;
            if !report.passed() {
                bail!(
                    "database validation failed: {} crashed, {} incorrect, {} missing handlers",
                    report.crashed,
                    report.incorrect,
                    report.missing_handlers.len()
                );
            }
        }
        DriverMode::CreateValidation => {
            let report = driver.create_validation()?;
            print_json(&report)?;
        }
    }
    Ok(())
}

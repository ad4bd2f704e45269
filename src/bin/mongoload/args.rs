use std::io::{IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use mongoload::config::{
    Config, Job, Mode, DEFAULT_COLLECTION, DEFAULT_CONNECTION_STRING, DEFAULT_DATABASE,
};

/// Drives configurable load against a MongoDB deployment and reports
/// throughput, errors and latency.
///
/// The run is described either by the flags below (a single job), by a
/// relaxed JSON config file, or by relaxed JSON piped through stdin.
/// Piped input takes precedence over the config file, which takes
/// precedence over the flags.
#[derive(Parser, Debug)]
#[command(name = "mongoload", version)]
pub struct Cli {
    /// Database connection string. `memory://` runs against an in-process store.
    #[arg(default_value = DEFAULT_CONNECTION_STRING)]
    pub connection_string: String,

    /// Number of concurrent connections
    #[arg(short = 'c', long, default_value_t = 1)]
    pub connections: u64,

    /// Pace, the operations per second limit (0 = unlimited)
    #[arg(short = 'p', long, default_value_t = 0)]
    pub pace: u64,

    /// Duration (ex. 10s, 5m, 1h)
    #[arg(short = 'd', long, value_parser = humantime::parse_duration, default_value = "0s")]
    pub duration: Duration,

    /// Operations to perform (0 = unlimited)
    #[arg(short = 'o', long, default_value_t = 0)]
    pub operations: u64,

    /// Batch size
    #[arg(short = 'b', long, default_value_t = 0)]
    pub batch_size: u64,

    /// Timeout for requests
    #[arg(short = 't', long, value_parser = humantime::parse_duration, default_value = "5s")]
    pub timeout: Duration,

    /// Config file path
    #[arg(short = 'f', long)]
    pub config_file: Option<PathBuf>,

    /// Display additional diagnostic information
    #[arg(long)]
    pub debug: bool,

    /// Operation performed by the job (write or read)
    #[arg(short = 'm', long, value_parser = parse_mode, default_value = "write")]
    pub mode: Mode,

    /// Database the job operates on
    #[arg(long, default_value = DEFAULT_DATABASE)]
    pub database: String,

    /// Collection the job operates on
    #[arg(long, default_value = DEFAULT_COLLECTION)]
    pub collection: String,
}

fn parse_mode(s: &str) -> Result<Mode, String> {
    match s {
        "write" => Ok(Mode::Write),
        "read" => Ok(Mode::Read),
        _ => Err(format!("unknown mode {s:?}, expected \"write\" or \"read\"")),
    }
}

/// Where the configuration came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Source {
    Stdin,
    File(PathBuf),
    Flags,
}

impl Cli {
    /// Builds the configuration, picking the source by precedence.
    /// `stdin` is whatever was piped into the process, if anything.
    ///
    /// The returned configuration is not validated yet.
    pub fn load_config(&self, stdin: Option<&str>) -> Result<(Config, Source)> {
        let (mut config, source) = match (stdin, &self.config_file) {
            (Some(content), _) if !content.trim().is_empty() => {
                let config = parse_relaxed_json(content)
                    .context("Failed to parse the configuration piped through stdin")?;
                (config, Source::Stdin)
            }
            (_, Some(path)) => (read_config_file(path)?, Source::File(path.clone())),
            _ => (self.config_from_flags(), Source::Flags),
        };
        config.debug |= self.debug;
        Ok((config, source))
    }

    fn config_from_flags(&self) -> Config {
        let job = Job {
            name: None,
            connections: self.connections,
            pace: self.pace,
            duration: self.duration,
            operations: self.operations,
            batch_size: self.batch_size,
            timeout: self.timeout,
            mode: self.mode,
            template: None,
            filter: None,
        };
        Config {
            connection_string: self.connection_string.clone(),
            debug: self.debug,
            database: self.database.clone(),
            collection: self.collection.clone(),
            jobs: vec![job],
        }
    }
}

/// Reads everything piped into the process. Returns `None` when stdin is
/// a terminal, so an interactive run never blocks waiting for input.
pub fn read_piped_stdin() -> Result<Option<String>> {
    let mut stdin = std::io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }
    let mut content = String::new();
    stdin
        .read_to_string(&mut content)
        .context("Failed to read the configuration from stdin")?;
    Ok(Some(content))
}

fn read_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read the config file {}", path.display()))?;
    parse_relaxed_json(&content)
        .with_context(|| format!("Failed to parse the config file {}", path.display()))
}

/// Parses JSON which may contain comments, trailing commas and unquoted keys.
pub fn parse_relaxed_json(content: &str) -> Result<Config> {
    Ok(json5::from_str(content)?)
}

pub fn print_configuration(config: &Config, out: &mut impl Write) -> Result<()> {
    writeln!(out, "Configuration")?;
    writeln!(out, "Connection string:\t{}", config.connection_string)?;
    writeln!(out, "Namespace:\t\t{}.{}", config.database, config.collection)?;
    for (index, job) in config.jobs.iter().enumerate() {
        writeln!(out, "Job {}:", job.display_name(index))?;
        writeln!(out, "  Mode:\t\t\t{}", job.mode)?;
        writeln!(out, "  Connections:\t\t{}", job.connections)?;
        if job.pace > 0 {
            writeln!(out, "  Pace:\t\t\t{} op/s", job.pace)?;
        } else {
            writeln!(out, "  Pace:\t\t\tunlimited")?;
        }
        if job.duration.is_zero() {
            writeln!(out, "  Duration:\t\tunlimited")?;
        } else {
            writeln!(out, "  Duration:\t\t{}", humantime::format_duration(job.duration))?;
        }
        if job.operations > 0 {
            writeln!(out, "  Operations:\t\t{}", job.operations)?;
        } else {
            writeln!(out, "  Operations:\t\tunlimited")?;
        }
        writeln!(out, "  Batch size:\t\t{}", job.batch_size)?;
        writeln!(out, "  Timeout:\t\t{}", humantime::format_duration(job.timeout))?;
    }
    writeln!(out)?;
    Ok(())
}

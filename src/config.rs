use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use snafu::Snafu;

use crate::backend::Record;

pub const DEFAULT_CONNECTION_STRING: &str = "mongodb://localhost:27017";
pub const DEFAULT_DATABASE: &str = "test";
pub const DEFAULT_COLLECTION: &str = "mongoload";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Describes a whole run: one connection target and the jobs to drive
/// against it.
///
/// Built once from external input, validated, and then only read.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    pub connection_string: String,
    pub debug: bool,

    /// Database and collection the jobs operate on.
    pub database: String,
    pub collection: String,

    pub jobs: Vec<Job>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection_string: DEFAULT_CONNECTION_STRING.to_string(),
            debug: false,
            database: DEFAULT_DATABASE.to_string(),
            collection: DEFAULT_COLLECTION.to_string(),
            jobs: Vec::new(),
        }
    }
}

/// A single workload.
///
/// Jobs do not refer back to the `Config` they belong to. Whatever they need
/// from it (the backend bound to the connection target) is handed to the
/// runner when it is created.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct Job {
    /// Label used in progress output and reports.
    pub name: Option<String>,

    /// Number of workers, each issuing one operation at a time.
    pub connections: u64,

    /// Maximum number of operations per second across all workers.
    /// Zero means unlimited.
    pub pace: u64,

    /// Wall-clock budget. Zero means unbounded.
    #[serde(with = "duration_serde")]
    pub duration: Duration,

    /// Total operation budget. Zero means unbounded.
    pub operations: u64,

    /// Records per insert call. 0 and 1 both mean single-record inserts.
    /// For reads, this is the cursor batch size (0 = store default).
    pub batch_size: u64,

    /// Deadline for a single operation.
    #[serde(with = "duration_serde")]
    pub timeout: Duration,

    pub mode: Mode,

    /// Record inserted by write jobs. Defaults to a small fixed document.
    pub template: Option<Record>,

    /// Filter used by read jobs. Defaults to matching everything.
    pub filter: Option<Record>,
}

impl Default for Job {
    fn default() -> Self {
        Self {
            name: None,
            connections: 1,
            pace: 0,
            duration: Duration::ZERO,
            operations: 0,
            batch_size: 0,
            timeout: DEFAULT_TIMEOUT,
            mode: Mode::Write,
            template: None,
            filter: None,
        }
    }
}

impl Job {
    pub fn display_name(&self, index: usize) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("job-{index}"),
        }
    }

    pub fn max_duration(&self) -> Option<Duration> {
        (self.duration > Duration::ZERO).then_some(self.duration)
    }

    pub fn max_operations(&self) -> Option<u64> {
        (self.operations > 0).then_some(self.operations)
    }

    pub fn rate_limit_per_second(&self) -> Option<f64> {
        (self.pace > 0).then_some(self.pace as f64)
    }

    fn collect_violations(&self, index: usize, out: &mut Vec<Violation>) {
        let mut violated = |field: &'static str, message: &'static str| {
            out.push(Violation {
                job: Some(self.display_name(index)),
                field,
                message,
            });
        };

        if self.connections == 0 {
            violated("connections", "must be at least 1");
        }
        if self.timeout.is_zero() {
            violated("timeout", "must be greater than zero");
        }
        if self.duration.is_zero() && self.operations == 0 {
            violated(
                "duration/operations",
                "no termination condition, at least one of them must be non-zero",
            );
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Write,
    Read,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Write => f.write_str("write"),
            Mode::Read => f.write_str("read"),
        }
    }
}

/// A single violated constraint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    /// Display name of the offending job, `None` for run-level fields.
    pub job: Option<String>,
    pub field: &'static str,
    pub message: &'static str,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.job {
            Some(job) => write!(f, "{job}: {}: {}", self.field, self.message),
            None => write!(f, "{}: {}", self.field, self.message),
        }
    }
}

/// Returned by [`Config::validate`], lists every violated constraint.
#[derive(Debug, Snafu)]
pub enum ValidationError {
    #[snafu(display("invalid configuration: {}", format_violations(violations)))]
    Invalid { violations: Vec<Violation> },
}

impl ValidationError {
    pub fn violations(&self) -> &[Violation] {
        match self {
            ValidationError::Invalid { violations } => violations,
        }
    }
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Config {
    pub fn new(connection_string: impl Into<String>, jobs: Vec<Job>) -> Self {
        Self {
            connection_string: connection_string.into(),
            jobs,
            ..Default::default()
        }
    }

    /// Checks all constraints and reports all of the violated ones at once.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut violations = Vec::new();

        let mut violated = |field: &'static str, message: &'static str| {
            violations.push(Violation {
                job: None,
                field,
                message,
            });
        };
        if self.connection_string.trim().is_empty() {
            violated("connectionString", "must not be empty");
        }
        if self.database.is_empty() {
            violated("database", "must not be empty");
        }
        if self.collection.is_empty() {
            violated("collection", "must not be empty");
        }
        if self.jobs.is_empty() {
            violated("jobs", "at least one job is required");
        }

        for (index, job) in self.jobs.iter().enumerate() {
            job.collect_violations(index, &mut violations);
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::Invalid { violations })
        }
    }
}

/// Durations are accepted either as humantime strings ("10s", "1m 30s")
/// or as integer nanoseconds.
mod duration_serde {
    use std::fmt;
    use std::time::Duration;

    use serde::de::{self, Visitor};
    use serde::Deserializer;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(DurationVisitor)
    }

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a duration string like \"10s\" or a number of nanoseconds")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
            humantime::parse_duration(v.trim()).map_err(E::custom)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_nanos(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_nanos)
                .map_err(|_| E::custom(format!("duration must not be negative: {v}")))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Duration, E> {
            if v < 0.0 || !v.is_finite() {
                return Err(E::custom(format!("invalid duration: {v}")));
            }
            Ok(Duration::from_nanos(v as u64))
        }
    }
}

use std::io::Write;
use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;

use mongoload::engine::EngineReport;
use mongoload::stats::{LatencySummary, LatencyType, RunReport, Stats};

pub struct StatsPrinter {
    start_time: Instant,
    previous_time: Instant,
}

impl StatsPrinter {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            previous_time: now,
        }
    }

    pub fn print_header(&self, out: &mut impl Write) -> Result<()> {
        writeln!(
            out,
            "{:9} {:12} {:>7} {:>9} {:>6} {:>6} {:>6} {:>6} {:>6} {:>6}",
            "time", "job", "ops/s", "records/s", "errors", "max", "99th", "90th", "median", "mean"
        )?;
        Ok(())
    }

    /// Prints one progress line per job. `intervals` holds what every job
    /// accounted since the previous call.
    pub fn print_partial(&mut self, intervals: &[(&str, Stats)], out: &mut impl Write) -> Result<()> {
        let now = Instant::now();
        let time = now - self.start_time;
        let secs = (now - self.previous_time).as_secs_f64();
        let per_second = |count: u64| {
            if secs > 0.0 {
                (count as f64 / secs).round() as u64
            } else {
                count
            }
        };

        for (name, stats) in intervals {
            let latency = stats.latency_summary(LatencyType::Raw);
            writeln!(
                out,
                "{:9} {:12} {:>7} {:>9} {:>6} {:>6} {:>6} {:>6} {:>6} {:>6}",
                format_duration(time),
                name,
                per_second(stats.attempted),
                per_second(stats.records),
                stats.failed,
                format_duration(latency.max),
                format_duration(latency.p99),
                format_duration(latency.p90),
                format_duration(latency.p50),
                format_duration(latency.mean),
            )?;
        }

        self.previous_time = now;
        Ok(())
    }

    pub fn print_final(&self, report: &EngineReport, out: &mut impl Write) -> Result<()> {
        writeln!(out)?;
        writeln!(out, "Results:")?;
        for run in &report.reports {
            print_run_report(run, out)?;
        }

        if !report.failures.is_empty() {
            writeln!(out)?;
            writeln!(out, "Failures:")?;
            for failure in &report.failures {
                writeln!(out, "  {}: {:#}", failure.job, failure.error)?;
            }
        }
        Ok(())
    }
}

fn print_run_report(run: &RunReport, out: &mut impl Write) -> Result<()> {
    writeln!(out)?;
    writeln!(out, "Job {} ({:?}):", run.name, run.state)?;
    writeln!(out, "  Time:\t\t{}", format_duration(run.elapsed))?;
    writeln!(out, "  Attempted:\t{}", run.attempted)?;
    writeln!(out, "  Succeeded:\t{}", run.succeeded)?;
    if run.failed != 0 {
        writeln!(out, "  Failed:\t{}", run.failed)?;
        writeln!(out, "  Timeouts:\t{}", run.timeouts)?;
    }
    writeln!(out, "  Records:\t{}", run.records)?;
    writeln!(out, "  Operations/s:\t{:.1}", run.throughput())?;
    writeln!(out, "  Records/s:\t{:.1}", run.records_per_second())?;

    if run.attempted > 0 {
        print_latency("raw latency", &run.latency, out)?;
        print_latency("c-o fixed latency", &run.co_fixed_latency, out)?;
    }
    Ok(())
}

fn print_latency(name: &str, latency: &LatencySummary, out: &mut impl Write) -> Result<()> {
    writeln!(out, "  {name}:")?;
    writeln!(out, "    max:\t{}", format_duration(latency.max))?;
    writeln!(out, "    99.9th:\t{}", format_duration(latency.p999))?;
    writeln!(out, "    99th:\t{}", format_duration(latency.p99))?;
    writeln!(out, "    90th:\t{}", format_duration(latency.p90))?;
    writeln!(out, "    median:\t{}", format_duration(latency.p50))?;
    writeln!(out, "    mean:\t{}", format_duration(latency.mean))?;
    Ok(())
}

/// Formats a duration compactly, truncated to tenths of a second above
/// one second and to three significant digits below: `1h2m3.4s`, `12.3ms`,
/// `456μs`.
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0".to_string();
    }

    if d >= Duration::from_secs(1) {
        let tenths = d.as_millis() / 100;
        let hours = tenths / 36_000;
        let minutes = (tenths / 600) % 60;
        let secs = tenths % 600;

        let mut s = String::with_capacity(16);
        if hours > 0 {
            s += &format!("{hours}h");
        }
        if minutes > 0 {
            s += &format!("{minutes}m");
        }
        s += &format!("{}.{}s", secs / 10, secs % 10);
        return s;
    }

    let nanos = d.subsec_nanos() as u64;
    let (unit_nanos, unit) = if nanos >= 1_000_000 {
        (1_000_000, "ms")
    } else if nanos >= 1_000 {
        (1_000, "μs")
    } else {
        return format!("{nanos}ns");
    };

    // Drop everything past the third significant digit, so the value
    // never grows into the next unit
    let round_unit = 10u64.pow(nanos.ilog10().saturating_sub(2));
    let nanos = nanos - nanos % round_unit;

    let whole = nanos / unit_nanos;
    let precision = 3 - (whole.ilog10() + 1);
    if precision == 0 {
        return format!("{whole}{unit}");
    }
    let fraction = (nanos % unit_nanos) / (unit_nanos / 10u64.pow(precision));
    format!("{whole}.{fraction:0width$}{unit}", width = precision as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        let cases = [
            (Duration::ZERO, "0"),
            (Duration::from_nanos(450), "450ns"),
            (Duration::from_micros(456), "456μs"),
            (Duration::from_micros(12_345), "12.3ms"),
            (Duration::from_micros(1_500), "1.50ms"),
            (Duration::from_millis(2_500), "2.5s"),
            (Duration::from_secs(3723), "1h2m3.0s"),
            (Duration::from_nanos(999_999), "999μs"),
            (Duration::from_nanos(999_999_999), "999ms"),
            (Duration::from_micros(9_999), "9.99ms"),
            (Duration::from_millis(59_990), "59.9s"),
            (Duration::from_millis(3_599_990), "59m59.9s"),
        ];
        for (d, expected) in cases {
            assert_eq!(format_duration(d), expected, "{d:?}");
        }
    }

    #[test]
    fn test_print_partial_lines_per_job() {
        let mut printer = StatsPrinter::new();
        let mut out = Vec::new();
        printer
            .print_partial(&[("writer", Stats::new()), ("reader", Stats::new())], &mut out)
            .unwrap();
        let out = String::from_utf8(out).unwrap();
        assert_eq!(out.lines().count(), 2);
        assert!(out.contains("writer"));
        assert!(out.contains("reader"));
    }
}

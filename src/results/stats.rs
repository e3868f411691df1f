//! Offline statistics over a persisted read-latency log.
//!
//! Rows are partitioned into cohorts by the enabled-item legend column using
//! the sink's run-length grouping, then each cohort is reduced to
//! descriptive statistics. Population variance is used (deviations divided
//! by n, not n-1): each cohort is the complete set of trials for its level,
//! not a sample of a larger one.

use super::ResultSink;
use std::io::{self, Write};

const HOSTS_COLUMN: usize = 0;
const ITEMS_COLUMN: usize = 1;
const LATENCY_COLUMN: usize = 3;

/// Descriptive statistics for one legend cohort.
#[derive(Debug, Clone)]
pub struct LatencyStatistics {
    pub n_hosts: i64,
    pub n_items: i64,
    pub length: usize,
    pub total: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub variance: f64,
    pub standard_deviation: f64,
    pub confidence_min: f64,
    pub confidence_max: f64,
}

/// Reduce a loaded read-latency log into per-cohort statistics, one entry
/// per contiguous legend run, in file order.
pub fn analyze(sink: &ResultSink) -> Vec<LatencyStatistics> {
    let mut statistics = Vec::new();
    sink.each_legend(ITEMS_COLUMN, |n_items, rows| {
        statistics.push(analyze_group(n_items, rows));
    });
    statistics
}

fn analyze_group(n_items: i64, rows: &[Vec<String>]) -> LatencyStatistics {
    let values: Vec<f64> = rows.iter().map(|row| float_at(row, LATENCY_COLUMN)).collect();

    let length = values.len();
    let total: f64 = values.iter().sum();
    let mean = total / length as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / length as f64;
    let standard_deviation = variance.sqrt();

    LatencyStatistics {
        n_hosts: rows
            .first()
            .map(|row| int_at(row, HOSTS_COLUMN))
            .unwrap_or(0),
        n_items,
        length,
        total,
        min: values.iter().copied().fold(f64::INFINITY, f64::min),
        max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        mean,
        variance,
        standard_deviation,
        confidence_min: mean - standard_deviation * 2.0,
        confidence_max: mean + standard_deviation * 2.0,
    }
}

/// Write the statistics report: a fixed header, then one line per cohort.
/// Grouping keys and the sample count are plain integers; every statistic is
/// rendered in scientific notation with four significant digits.
pub fn write_report<W: Write>(statistics: &[LatencyStatistics], out: &mut W) -> io::Result<()> {
    writeln!(
        out,
        "Enabled hosts,Enabled items,Length,Min,Max,Mean,\
         Variance,Standard deviation,Confidence min,Confidence max"
    )?;
    for s in statistics {
        writeln!(
            out,
            "{},{},{},{:.3e},{:.3e},{:.3e},{:.3e},{:.3e},{:.3e},{:.3e}",
            s.n_hosts,
            s.n_items,
            s.length,
            s.min,
            s.max,
            s.mean,
            s.variance,
            s.standard_deviation,
            s.confidence_min,
            s.confidence_max,
        )?;
    }
    Ok(())
}

fn float_at(row: &[String], column: usize) -> f64 {
    row.get(column)
        .and_then(|field| field.trim().parse().ok())
        .unwrap_or(0.0)
}

fn int_at(row: &[String], column: usize) -> i64 {
    row.get(column)
        .and_then(|field| field.trim().parse().ok())
        .unwrap_or(0)
}

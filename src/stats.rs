use std::io::{self, Write};

/// Quantiles reported for every run, in ascending order.
pub const PERCENTILES: [(&str, f64); 6] = [
    ("p50", 0.50),
    ("p75", 0.75),
    ("p90", 0.90),
    ("p99", 0.99),
    ("p99.9", 0.999),
    ("p99.99", 0.9999),
];

/// What one connection group hands back after its threads are joined.
#[derive(Debug, Default)]
pub struct GroupResult {
    /// Merged latency samples in microseconds: the primary's sequence
    /// followed by each sibling's, issue-ordered within each thread.
    pub samples: Vec<u64>,
    /// Sum of the group's per-thread throughputs (requests/second).
    pub throughput: f64,
    pub failures: u64,
}

#[derive(Debug)]
pub struct AggregateReport {
    /// Mean of the per-group means, every group weighted equally. This is
    /// deliberately not the mean of the flattened sample set.
    pub avg_us: f64,
    pub percentiles: [u64; 6],
    pub throughput: f64,
    pub samples: usize,
    pub failures: u64,
}

/// Rate derived from a thread's own accumulated latency mass rather than
/// its wall-clock span; the documented contract, not a bug to fix here.
pub fn thread_throughput(samples: &[u64]) -> f64 {
    let total_us: u64 = samples.iter().sum();
    if total_us == 0 {
        return 0.0;
    }
    samples.len() as f64 / (total_us as f64 / 1e6)
}

/// Nearest-rank percentile over an ascending-sorted slice, with the
/// truncated index clamped so boundary quantiles on tiny sets stay in
/// bounds.
pub fn percentile(sorted: &[u64], q: f64) -> u64 {
    let idx = ((sorted.len() as f64 * q) as usize).min(sorted.len() - 1);
    sorted[idx]
}

fn mean(samples: &[u64]) -> f64 {
    samples.iter().sum::<u64>() as f64 / samples.len() as f64
}

/// Reduce all group results into the final report. Returns `None` when no
/// samples were collected anywhere (the report is suppressed). Groups that
/// contributed no samples are absent from the mean-of-means, not
/// zero-filled.
pub fn aggregate(groups: &[GroupResult]) -> Option<AggregateReport> {
    let mut merged: Vec<u64> = Vec::with_capacity(groups.iter().map(|g| g.samples.len()).sum());
    let mut group_means: Vec<f64> = Vec::with_capacity(groups.len());
    let mut throughput = 0.0;
    let mut failures = 0;

    for group in groups {
        if !group.samples.is_empty() {
            group_means.push(mean(&group.samples));
            merged.extend_from_slice(&group.samples);
        }
        throughput += group.throughput;
        failures += group.failures;
    }

    if merged.is_empty() {
        return None;
    }
    merged.sort_unstable();

    let mut percentiles = [0u64; 6];
    for (slot, (_, q)) in percentiles.iter_mut().zip(PERCENTILES.iter()) {
        *slot = percentile(&merged, *q);
    }

    Some(AggregateReport {
        avg_us: group_means.iter().sum::<f64>() / group_means.len() as f64,
        percentiles,
        throughput,
        samples: merged.len(),
        failures,
    })
}

pub fn render_human<W: Write>(w: &mut W, report: &AggregateReport) -> io::Result<()> {
    writeln!(w, "Latency (us):")?;
    writeln!(w, "avg: {:.6}", report.avg_us)?;
    for ((label, _), value) in PERCENTILES.iter().zip(report.percentiles.iter()) {
        writeln!(w, "{}: {}", label, value)?;
    }
    writeln!(w, "Throughput: {:.6} RPS", report.throughput)?;
    writeln!(w, "Samples: {}", report.samples)?;
    if report.failures > 0 {
        writeln!(w, "Failed requests: {}", report.failures)?;
    }
    Ok(())
}

/// Compact single-line form: `avg,p50,p99.9,throughput,sample_count`.
pub fn render_csv<W: Write>(w: &mut W, report: &AggregateReport) -> io::Result<()> {
    writeln!(
        w,
        "{:.6},{},{},{:.6},{}",
        report.avg_us,
        report.percentiles[0],
        report.percentiles[4],
        report.throughput,
        report.samples
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(samples: Vec<u64>) -> GroupResult {
        let throughput = thread_throughput(&samples);
        GroupResult {
            samples,
            throughput,
            failures: 0,
        }
    }

    #[test]
    fn percentile_is_nearest_rank() {
        // Scenario A: 10 samples, p50 is the 5th (0-indexed) sorted value.
        let sorted: Vec<u64> = (1..=10).collect();
        assert_eq!(percentile(&sorted, 0.50), 6);
        assert_eq!(percentile(&sorted, 0.90), 10);
    }

    #[test]
    fn percentile_clamps_at_the_boundary() {
        assert_eq!(percentile(&[7], 0.9999), 7);
        assert_eq!(percentile(&[3, 9], 0.9999), 9);
    }

    #[test]
    fn percentiles_are_monotonic() {
        let groups = [group(vec![120, 5, 3000, 42, 42, 17, 950, 8, 8, 61])];
        let report = aggregate(&groups).unwrap();
        for pair in report.percentiles.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }

    #[test]
    fn average_is_mean_of_group_means() {
        // Unequal group sizes: mean-of-means differs from the global mean.
        let groups = [group(vec![10, 10, 10, 10]), group(vec![100])];
        let report = aggregate(&groups).unwrap();
        assert_eq!(report.avg_us, 55.0);
        let global: f64 = 140.0 / 5.0;
        assert_ne!(report.avg_us, global);
        assert_eq!(report.samples, 5);
    }

    #[test]
    fn throughput_is_additive_across_groups() {
        // Two samples of 500us each: 2 requests over 1ms of latency mass.
        let expected = 2.0 / (1000.0 / 1e6);
        assert!((thread_throughput(&[500, 500]) - expected).abs() < 1e-9);
        let groups = [group(vec![500, 500]), group(vec![1000])];
        let report = aggregate(&groups).unwrap();
        let sum = thread_throughput(&[500, 500]) + thread_throughput(&[1000]);
        assert!((report.throughput - sum).abs() < 1e-9);
    }

    #[test]
    fn empty_groups_are_absent_not_zero_filled() {
        let groups = [group(vec![]), group(vec![20, 40])];
        let report = aggregate(&groups).unwrap();
        assert_eq!(report.avg_us, 30.0);
        assert_eq!(report.samples, 2);
    }

    #[test]
    fn no_samples_suppresses_the_report() {
        assert!(aggregate(&[group(vec![]), group(vec![])]).is_none());
        assert!(aggregate(&[]).is_none());
    }

    #[test]
    fn csv_line_shape() {
        let report = aggregate(&[group(vec![10, 20, 30, 40])]).unwrap();
        let mut out = Vec::new();
        render_csv(&mut out, &report).unwrap();
        let line = String::from_utf8(out).unwrap();
        assert_eq!(line.trim().split(',').count(), 5);
        assert!(line.starts_with("25.000000,"));
    }

    #[test]
    fn human_report_labels() {
        let report = aggregate(&[group(vec![10, 20, 30, 40])]).unwrap();
        let mut out = Vec::new();
        render_human(&mut out, &report).unwrap();
        let text = String::from_utf8(out).unwrap();
        for label in ["avg:", "p50:", "p99.9:", "Throughput:", "Samples: 4"] {
            assert!(text.contains(label), "missing {}", label);
        }
    }
}

//! Descriptive statistics over one metric's filtered values

use statrs::statistics::Statistics;

/// Summary of a value set; every stat is `None` when the set is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Summary {
    pub count: i64,
    pub avg: Option<f64>,
    pub max: Option<f64>,
    pub min: Option<f64>,
    pub stddev: Option<f64>,
    pub median: Option<f64>,
}

/// Summarize `values` in the order given (callers pass SQL-ordered values so
/// floating-point accumulation is identical from run to run).
pub fn summarize(values: &[f64]) -> Summary {
    if values.is_empty() {
        return Summary::default();
    }

    let mut sorted = values.to_vec();
    sort_values(&mut sorted);

    Summary {
        count: values.len() as i64,
        avg: Some(values.iter().mean()),
        max: sorted.last().copied(),
        min: sorted.first().copied(),
        stddev: Some(population_std_dev(values)),
        median: median(&sorted),
    }
}

/// Median of an ascending slice; even counts average the middle two.
pub fn median(sorted: &[f64]) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    let mid = n / 2;
    if n % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Population standard deviation (divides by n). Zero for fewer than two values.
pub fn population_std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    values.iter().population_std_dev()
}

/// Arithmetic mean, `0.0` for an empty set.
pub fn mean_or_zero(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().mean()
    }
}

#[inline]
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// `(current - previous, (current - previous) / previous * 100)`.
/// The percentage is `None` when there is nothing to compare against.
pub fn change(current: Option<f64>, previous: Option<f64>) -> (Option<f64>, Option<f64>) {
    match (current, previous) {
        (Some(cur), Some(prev)) => {
            let abs = cur - prev;
            let pct = if prev != 0.0 {
                Some(abs / prev * 100.0)
            } else {
                None
            };
            (Some(abs), pct)
        }
        _ => (None, None),
    }
}

pub fn sort_values(values: &mut [f64]) {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median() {
        assert_eq!(median(&[1.0, 2.0, 3.0, 4.0]), Some(2.5));
        assert_eq!(median(&[1.0, 2.0, 3.0]), Some(2.0));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_summarize_empty() {
        let s = summarize(&[]);
        assert_eq!(s.count, 0);
        assert!(s.avg.is_none());
        assert!(s.median.is_none());
        assert!(s.stddev.is_none());
    }

    #[test]
    fn test_summarize_unsorted_input() {
        let s = summarize(&[4.0, 1.0, 3.0, 2.0]);
        assert_eq!(s.count, 4);
        assert_eq!(s.min, Some(1.0));
        assert_eq!(s.max, Some(4.0));
        assert_eq!(s.median, Some(2.5));
        assert!((s.avg.unwrap() - 2.5).abs() < 1e-12);
        // population sd of 1..4 is sqrt(1.25)
        assert!((s.stddev.unwrap() - 1.25f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_single_value_has_zero_spread() {
        let s = summarize(&[7.5]);
        assert_eq!(s.stddev, Some(0.0));
        assert_eq!(s.median, Some(7.5));
    }

    #[test]
    fn test_change() {
        assert_eq!(change(Some(15.0), Some(10.0)), (Some(5.0), Some(50.0)));
        assert_eq!(change(Some(3.0), Some(0.0)), (Some(3.0), None));
        assert_eq!(change(Some(3.0), None), (None, None));
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(31.456), 31.46);
        assert_eq!(round2(-0.004), -0.0);
    }
}

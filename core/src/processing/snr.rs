use crate::math::stats::StatsHelper;

/// Detection statistic of a folded profile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnrEstimate {
    pub snr: f64,
    /// Pulse width in bins.
    pub width: usize,
    /// First on-pulse bin; the window wraps around the profile end.
    pub start: usize,
}

impl SnrEstimate {
    pub fn none() -> Self {
        Self {
            snr: 0.0,
            width: 1,
            start: 0,
        }
    }
}

pub trait SnrEstimator: Send + Sync {
    fn estimate(&self, profile: &[f32]) -> SnrEstimate;
}

/// Boxcar matched filter over circular windows of 1..=nbin/2 bins.
///
/// The best window is chosen against whole-profile statistics, then its S/N
/// is re-measured against the off-pulse bins when there are enough of them.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoxcarSnr {
    max_width: Option<usize>,
}

impl BoxcarSnr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_width(max_width: usize) -> Self {
        Self {
            max_width: Some(max_width.max(1)),
        }
    }
}

impl SnrEstimator for BoxcarSnr {
    fn estimate(&self, profile: &[f32]) -> SnrEstimate {
        let n = profile.len();
        if n < 2 {
            return SnrEstimate::none();
        }
        let values: Vec<f64> = profile.iter().map(|&v| v as f64).collect();
        let (mean, std) = StatsHelper::mean_std(profile);
        if std.is_nan() || std <= 0.0 {
            return SnrEstimate::none();
        }

        let max_width = self.max_width.unwrap_or(n / 2).clamp(1, n.max(2) / 2);
        let mut best = SnrEstimate::none();
        let mut best_score = f64::NEG_INFINITY;
        for width in 1..=max_width {
            let mut window: f64 = (0..width).map(|i| values[i % n]).sum();
            for start in 0..n {
                if start > 0 {
                    window += values[(start + width - 1) % n] - values[start - 1];
                }
                let score = (window - width as f64 * mean) / (std * (width as f64).sqrt());
                if score > best_score {
                    best_score = score;
                    best = SnrEstimate {
                        snr: score,
                        width,
                        start,
                    };
                }
            }
        }

        let on_pulse = |i: usize| (i + n - best.start) % n < best.width;
        let off: Vec<f32> = (0..n).filter(|&i| !on_pulse(i)).map(|i| profile[i]).collect();
        let (off_mean, off_std) = StatsHelper::mean_std(&off);
        if off.len() >= 2 && off_std > 0.0 {
            let window: f64 = (0..best.width).map(|k| values[(best.start + k) % n]).sum();
            best.snr = (window - best.width as f64 * off_mean)
                / (off_std * (best.width as f64).sqrt());
        }
        best
    }
}

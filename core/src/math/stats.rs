pub struct StatsHelper;

impl StatsHelper {
    pub fn mean(samples: &[f32]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        samples.iter().map(|&v| v as f64).sum::<f64>() / samples.len() as f64
    }

    /// Mean and population standard deviation.
    pub fn mean_std(samples: &[f32]) -> (f64, f64) {
        if samples.is_empty() {
            return (0.0, 0.0);
        }
        let mean = Self::mean(samples);
        let var = samples
            .iter()
            .map(|&v| {
                let d = v as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / samples.len() as f64;
        (mean, var.max(0.0).sqrt())
    }

    /// Maximum-sum contiguous run (Kadane). Returns `(start, len, sum)`, or
    /// `None` when every value is non-positive.
    pub fn kadane(values: &[f32]) -> Option<(usize, usize, f64)> {
        let mut best: Option<(usize, usize, f64)> = None;
        let mut run_start = 0;
        let mut run_sum = 0.0f64;
        for (idx, &value) in values.iter().enumerate() {
            if run_sum <= 0.0 {
                run_start = idx;
                run_sum = 0.0;
            }
            run_sum += value as f64;
            if run_sum > 0.0 && best.map_or(true, |(_, _, s)| run_sum > s) {
                best = Some((run_start, idx + 1 - run_start, run_sum));
            }
        }
        best
    }
}

/// Per-channel running mean/variance, merged block by block with the
/// parallel Welford combination.
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    count: f64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn merge_samples<I: IntoIterator<Item = f32>>(&mut self, samples: I) {
        let mut n = 0.0f64;
        let mut mean = 0.0f64;
        let mut m2 = 0.0f64;
        for value in samples {
            n += 1.0;
            let delta = value as f64 - mean;
            mean += delta / n;
            m2 += delta * (value as f64 - mean);
        }
        if n == 0.0 {
            return;
        }
        let total = self.count + n;
        let delta = mean - self.mean;
        self.mean += delta * n / total;
        self.m2 += m2 + delta * delta * self.count * n / total;
        self.count = total;
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        if self.count > 0.0 {
            (self.m2 / self.count).max(0.0)
        } else {
            0.0
        }
    }

    pub fn count(&self) -> u64 {
        self.count as u64
    }
}

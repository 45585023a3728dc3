pub mod dispersion;
pub mod fft;
pub mod stats;

pub use dispersion::{delay_table, dm_delay, DISPERSION_CONSTANT};
pub use fft::FftHelper;
pub use stats::{RunningStats, StatsHelper};

/// Greatest common divisor.
pub fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Least common multiple of every value (1 for an empty slice).
pub fn lcm(values: &[usize]) -> usize {
    values
        .iter()
        .copied()
        .filter(|&v| v > 0)
        .fold(1, |acc, v| acc / gcd(acc, v) * v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lcm_of_downsample_factors() {
        assert_eq!(lcm(&[2, 3, 4]), 12);
        assert_eq!(lcm(&[]), 1);
        assert_eq!(lcm(&[1, 1]), 1);
    }
}

use std::cmp::min;
use std::time::Duration;

use crate::config::ReconnectConfig;

/// Delays between reconnect attempts: starting at an initial delay, each attempt multiplies the
///  delay by a factor (in eighths, so 12 is 1.5x and 16 is 2x), capped at a maximum.
pub struct ExponentialBackoff {
    next_delay: Duration,

    config_max_delay: Duration,
    config_factor_eighths: u32,
}

impl ExponentialBackoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        assert!(config.factor_eighths >= 8);

        ExponentialBackoff {
            next_delay: config.initial_delay,
            config_max_delay: config.max_delay,
            config_factor_eighths: config.factor_eighths,
        }
    }

    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        let result = self.next_delay;

        let scaled = (self.next_delay * self.config_factor_eighths) / 8;
        self.next_delay = min(scaled, self.config_max_delay);
        result
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::double(100, 30_000, 16, vec![100, 200, 400, 800])]
    #[case::factor_1_5(100, 30_000, 12, vec![100, 150, 225, 337])]
    #[case::capped(100, 300, 16, vec![100, 200, 300, 300, 300])]
    #[case::constant(50, 30_000, 8, vec![50, 50, 50])]
    fn test_next_delay(#[case] initial_millis: u64, #[case] max_millis: u64, #[case] factor_eighths: u32, #[case] expected_millis: Vec<u64>) {
        let mut backoff = ExponentialBackoff::new(&ReconnectConfig {
            initial_delay: Duration::from_millis(initial_millis),
            max_delay: Duration::from_millis(max_millis),
            factor_eighths,
        });

        for expected in expected_millis {
            assert_eq!(backoff.next_delay().as_millis() as u64, expected);
        }
    }
}

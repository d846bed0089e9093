use std::cmp::min;
use std::time::Duration;

use crate::config::StreamConfig;

/// Exponential backoff for retransmitting unacknowledged messages: the delay grows by a factor
///  (in eighths) with every transmission attempt, up to a maximum.
#[derive(Debug, Clone)]
pub struct RetransmitBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    factor_eighths: u32,
}

impl RetransmitBackoff {
    pub fn new(config: &StreamConfig) -> RetransmitBackoff {
        RetransmitBackoff::with_params(config.retransmit_initial_delay, config.retransmit_max_delay, config.retransmit_backoff_factor_eighths)
    }

    pub fn with_params(initial_delay: Duration, max_delay: Duration, factor_eighths: u32) -> RetransmitBackoff {
        assert!(factor_eighths >= 8);

        RetransmitBackoff {
            initial_delay,
            max_delay,
            factor_eighths,
        }
    }

    /// The delay before the next retransmission of a message that was transmitted `attempts`
    ///  times so far
    #[must_use]
    pub fn delay_after(&self, attempts: u32) -> Duration {
        let max_micros = self.max_delay.as_micros();
        let mut micros = min(self.initial_delay.as_micros(), max_micros);
        for _ in 1..attempts {
            if micros >= max_micros {
                break;
            }
            micros = min((micros * self.factor_eighths as u128) >> 3, max_micros);
        }
        Duration::from_micros(micros.try_into().unwrap_or(u64::MAX))
    }
}

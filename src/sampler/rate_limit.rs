//! Leaky-bucket credit accounting used by the rate-limiting samplers and
//! nothing else; callers provide their own locking.

use std::time::Instant;

/// A token bucket refilled continuously at `credits_per_second`, holding at
/// most `max_balance` credits. Each successful check debits one credit.
#[derive(Debug)]
pub(crate) struct LeakyBucket {
    credits_per_second: f64,
    max_balance: f64,
    balance: f64,
    last_tick: Instant,
}

impl LeakyBucket {
    pub(crate) fn new(max_balance: f64, credits_per_second: f64) -> Self {
        LeakyBucket {
            credits_per_second,
            max_balance,
            balance: max_balance,
            last_tick: Instant::now(),
        }
    }

    /// Change the refill rate and capacity. The current balance is preserved,
    /// clamped to the new capacity.
    pub(crate) fn update(&mut self, credits_per_second: f64, max_balance: f64) {
        self.credits_per_second = credits_per_second;
        self.max_balance = max_balance;
        self.balance = self.balance.min(max_balance);
    }

    /// Debit one credit if available.
    pub(crate) fn check_credit(&mut self) -> bool {
        self.check_credit_at(Instant::now())
    }

    fn check_credit_at(&mut self, now: Instant) -> bool {
        if self.balance >= 1.0 {
            self.balance -= 1.0;
            return true;
        }
        let elapsed = now.saturating_duration_since(self.last_tick);
        self.last_tick = now;
        self.balance = (self.balance + elapsed.as_secs_f64() * self.credits_per_second)
            .min(self.max_balance);
        if self.balance >= 1.0 {
            self.balance -= 1.0;
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    pub(crate) fn balance(&self) -> f64 {
        self.balance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn bucket_drains_and_refills() {
        // maximum balance 2, one credit every 10 seconds
        let start = Instant::now();
        let mut bucket = LeakyBucket::new(2.0, 0.1);
        bucket.last_tick = start;

        let cases = vec![
            (0u64, vec![true, true, false]),
            (1, vec![false]),
            (5, vec![false]),
            (10, vec![true, false]),
            // balance is capped at 2 no matter how long the idle period
            (600, vec![true, true, false]),
        ];
        for (elapsed_sec, expectations) in cases {
            for expected in expectations {
                assert_eq!(
                    expected,
                    bucket.check_credit_at(start + Duration::from_secs(elapsed_sec)),
                    "at t+{}s",
                    elapsed_sec
                );
            }
        }
    }

    #[test]
    fn update_preserves_balance() {
        let start = Instant::now();
        let mut bucket = LeakyBucket::new(3.0, 1.0);
        bucket.last_tick = start;
        assert!(bucket.check_credit_at(start));
        assert!((bucket.balance() - 2.0).abs() < f64::EPSILON);

        bucket.update(5.0, 10.0);
        assert!((bucket.balance() - 2.0).abs() < f64::EPSILON);

        // Shrinking the capacity clamps the balance.
        bucket.update(5.0, 1.0);
        assert!((bucket.balance() - 1.0).abs() < f64::EPSILON);
    }
}

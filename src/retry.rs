use rand::Rng;
use std::time::Duration;

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub base_ms: u64,
  pub cap_ms: u64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_ms: 1000,
      cap_ms: 30_000,
    }
  }
}

impl RetryPolicy {
  /// Delay before retry number `attempt` (0-based): base * 2^attempt,
  /// capped, with up to 25% additive jitter to avoid thundering herds.
  pub fn delay(&self, attempt: u32) -> Duration {
    let exp = self
      .base_ms
      .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let capped = exp.min(self.cap_ms);
    let jitter = rand::thread_rng().gen_range(0..=capped / 4);
    Duration::from_millis(capped + jitter)
  }

  pub fn exhausted(&self, attempt: u32) -> bool {
    attempt >= self.max_attempts
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn delay_grows_and_caps() {
    let policy = RetryPolicy {
      max_attempts: 5,
      base_ms: 100,
      cap_ms: 400,
    };
    // Jitter adds at most 25%, so bounds are deterministic.
    let d0 = policy.delay(0).as_millis() as u64;
    assert!((100..=125).contains(&d0), "got {}", d0);
    let d1 = policy.delay(1).as_millis() as u64;
    assert!((200..=250).contains(&d1), "got {}", d1);
    let d4 = policy.delay(4).as_millis() as u64;
    assert!((400..=500).contains(&d4), "got {}", d4);
  }

  #[test]
  fn shift_overflow_saturates_to_cap() {
    let policy = RetryPolicy {
      max_attempts: 100,
      base_ms: 100,
      cap_ms: 1000,
    };
    let d = policy.delay(80).as_millis() as u64;
    assert!(d >= 1000 && d <= 1250);
  }

  #[test]
  fn exhaustion_boundary() {
    let policy = RetryPolicy::default();
    assert!(!policy.exhausted(2));
    assert!(policy.exhausted(3));
  }
}

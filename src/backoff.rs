/// 发布重试的指数退避
use rand::Rng;
use std::time::Duration;

pub const MIN_WAIT: Duration = Duration::from_millis(500);
pub const MAX_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffState {
    current_wait: Duration,
    min_wait: Duration,
    max_wait: Duration,
}

impl Default for BackoffState {
    fn default() -> Self {
        Self::new(MIN_WAIT, MAX_WAIT)
    }
}

impl BackoffState {
    pub fn new(min_wait: Duration, max_wait: Duration) -> Self {
        Self {
            current_wait: min_wait,
            min_wait,
            max_wait: max_wait.max(min_wait),
        }
    }

    pub fn current_wait(&self) -> Duration {
        self.current_wait
    }

    pub fn min_wait(&self) -> Duration {
        self.min_wait
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// 发布成功：回到最小等待
    pub fn reset(&mut self) {
        self.current_wait = self.min_wait;
    }

    /// 失败且没有剩余路由：等待翻倍（不超过上限），返回 [wait, 2*wait] 内的随机延迟
    pub fn on_failure<R: Rng>(&mut self, rng: &mut R) -> Duration {
        self.current_wait = (self.current_wait * 2).min(self.max_wait);
        let wait = self.current_wait.as_secs_f64();
        Duration::from_secs_f64(rng.random_range(wait..=2.0 * wait))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_wait_doubles_until_cap() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut backoff = BackoffState::default();
        for n in 1..=10u32 {
            backoff.on_failure(&mut rng);
            let expected = (MIN_WAIT * 2u32.pow(n)).min(MAX_WAIT);
            assert_eq!(backoff.current_wait(), expected, "after {} failures", n);
        }
        assert_eq!(backoff.current_wait(), MAX_WAIT);
    }

    #[test]
    fn test_jitter_within_bounds() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut backoff = BackoffState::default();
        for _ in 0..20 {
            let delay = backoff.on_failure(&mut rng);
            assert!(delay >= backoff.current_wait());
            assert!(delay <= backoff.current_wait() * 2);
        }
    }

    #[test]
    fn test_reset_returns_to_min() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut backoff = BackoffState::default();
        backoff.on_failure(&mut rng);
        backoff.on_failure(&mut rng);
        backoff.reset();
        assert_eq!(backoff.current_wait(), MIN_WAIT);
    }
}

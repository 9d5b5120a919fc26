//! Redelivery policy: how many times to retry and how long to wait.

use std::time::Duration;

use rand::Rng;

use crate::error::ConfigError;

/// Delays keyed by attempt number, parsed from `"count:millis;count:millis"`.
///
/// The delay for an attempt is the one of the last group whose count is not
/// greater than the attempt; attempts before the first group get no delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayPattern {
    groups: Vec<(u32, Duration)>,
}

impl DelayPattern {
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidDelayPattern`] if a group is not of the
    /// form `count:millis` with non-negative integers.
    pub fn parse(pattern: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidDelayPattern {
            pattern: pattern.to_string(),
            reason,
        };
        let mut groups = Vec::new();
        for group in pattern.split(';').map(str::trim).filter(|g| !g.is_empty()) {
            let (count, delay) = group
                .split_once(':')
                .ok_or_else(|| invalid(format!("group {group:?} has no ':'")))?;
            let count: u32 = count
                .trim()
                .parse()
                .map_err(|e| invalid(format!("bad count in {group:?}: {e}")))?;
            let delay: u64 = delay
                .trim()
                .parse()
                .map_err(|e| invalid(format!("bad delay in {group:?}: {e}")))?;
            groups.push((count, Duration::from_millis(delay)));
        }
        if groups.is_empty() {
            return Err(invalid("no groups".to_string()));
        }
        Ok(Self { groups })
    }

    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let mut answer = Duration::ZERO;
        for &(count, delay) in &self.groups {
            if count > attempt {
                break;
            }
            answer = delay;
        }
        answer
    }
}

/// Retry settings for an error handler or exception policy.
///
/// Defaults: no redeliveries, 1s initial delay, 60s maximum delay, back-off
/// multiplier 2 (used only when exponential back-off is on), collision
/// avoidance factor 0.15 (used only when collision avoidance is on).
#[derive(Debug, Clone)]
pub struct RedeliveryPolicy {
    maximum_redeliveries: i32,
    redelivery_delay: Duration,
    maximum_redelivery_delay: Duration,
    back_off_multiplier: f64,
    use_exponential_back_off: bool,
    use_collision_avoidance: bool,
    collision_avoidance_factor: f64,
    delay_pattern: Option<DelayPattern>,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            maximum_redeliveries: 0,
            redelivery_delay: Duration::from_secs(1),
            maximum_redelivery_delay: Duration::from_secs(60),
            back_off_multiplier: 2.0,
            use_exponential_back_off: false,
            use_collision_avoidance: false,
            collision_avoidance_factor: 0.15,
            delay_pattern: None,
        }
    }
}

impl RedeliveryPolicy {
    /// Negative means retry forever; zero disables redelivery.
    #[must_use]
    pub fn with_maximum_redeliveries(mut self, maximum: i32) -> Self {
        self.maximum_redeliveries = maximum;
        self
    }

    #[must_use]
    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    /// Caps computed delays. `Duration::ZERO` removes the cap.
    #[must_use]
    pub fn with_maximum_redelivery_delay(mut self, delay: Duration) -> Self {
        self.maximum_redelivery_delay = delay;
        self
    }

    #[must_use]
    pub fn with_back_off_multiplier(mut self, multiplier: f64) -> Self {
        self.back_off_multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn with_exponential_back_off(mut self) -> Self {
        self.use_exponential_back_off = true;
        self
    }

    #[must_use]
    pub fn with_collision_avoidance(mut self) -> Self {
        self.use_collision_avoidance = true;
        self
    }

    #[must_use]
    pub fn with_collision_avoidance_factor(mut self, factor: f64) -> Self {
        self.collision_avoidance_factor = factor;
        self
    }

    /// Uses per-attempt delays instead of the computed back-off.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidDelayPattern`] if `pattern` is malformed.
    pub fn with_delay_pattern(mut self, pattern: &str) -> Result<Self, ConfigError> {
        self.delay_pattern = Some(DelayPattern::parse(pattern)?);
        Ok(self)
    }

    #[must_use]
    pub fn maximum_redeliveries(&self) -> i32 {
        self.maximum_redeliveries
    }

    #[must_use]
    pub fn redelivery_delay(&self) -> Duration {
        self.redelivery_delay
    }

    #[must_use]
    pub fn maximum_redelivery_delay(&self) -> Duration {
        self.maximum_redelivery_delay
    }

    /// Whether attempt number `attempt` (1-based) is still allowed.
    #[must_use]
    pub fn should_redeliver(&self, attempt: u32) -> bool {
        match u32::try_from(self.maximum_redeliveries) {
            Err(_) => true,
            Ok(maximum) => attempt <= maximum,
        }
    }

    /// Delay before attempt `attempt`, given the delay used before the
    /// previous attempt (`Duration::ZERO` for the first one).
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn calculate_delay(&self, previous: Duration, attempt: u32) -> Duration {
        if let Some(pattern) = &self.delay_pattern {
            return pattern.delay_for(attempt);
        }

        let previous_ms = previous.as_millis() as f64;
        let mut delay_ms = if previous.is_zero() {
            self.redelivery_delay.as_millis() as f64
        } else if self.use_exponential_back_off && self.back_off_multiplier > 1.0 {
            (previous_ms * self.back_off_multiplier).round()
        } else {
            previous_ms
        };

        if self.use_collision_avoidance {
            let mut rng = rand::rng();
            let direction = if rng.random_bool(0.5) {
                self.collision_avoidance_factor
            } else {
                -self.collision_avoidance_factor
            };
            delay_ms += delay_ms * direction * rng.random::<f64>();
        }

        let delay = Duration::from_millis(delay_ms.max(0.0) as u64);
        if !self.maximum_redelivery_delay.is_zero() && delay > self.maximum_redelivery_delay {
            self.maximum_redelivery_delay
        } else {
            delay
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn redelivery_limits() {
        let none = RedeliveryPolicy::default();
        assert!(!none.should_redeliver(1));

        let three = RedeliveryPolicy::default().with_maximum_redeliveries(3);
        assert!(three.should_redeliver(3));
        assert!(!three.should_redeliver(4));

        let forever = RedeliveryPolicy::default().with_maximum_redeliveries(-1);
        assert!(forever.should_redeliver(10_000));
    }

    #[test]
    fn fixed_delay_repeats() {
        let policy = RedeliveryPolicy::default().with_redelivery_delay(ms(200));
        let first = policy.calculate_delay(Duration::ZERO, 1);
        assert_eq!(first, ms(200));
        assert_eq!(policy.calculate_delay(first, 2), ms(200));
    }

    #[test]
    fn exponential_back_off_is_capped() {
        let policy = RedeliveryPolicy::default()
            .with_redelivery_delay(ms(100))
            .with_exponential_back_off()
            .with_back_off_multiplier(3.0)
            .with_maximum_redelivery_delay(ms(1000));

        let mut delay = Duration::ZERO;
        let mut seen = Vec::new();
        for attempt in 1..=4 {
            delay = policy.calculate_delay(delay, attempt);
            seen.push(delay);
        }
        assert_eq!(seen, vec![ms(100), ms(300), ms(900), ms(1000)]);
    }

    #[test]
    fn collision_avoidance_stays_within_factor() {
        let policy = RedeliveryPolicy::default()
            .with_redelivery_delay(ms(1000))
            .with_collision_avoidance();
        for _ in 0..100 {
            let delay = policy.calculate_delay(Duration::ZERO, 1);
            assert!(delay >= ms(850) && delay <= ms(1150), "{delay:?}");
        }
    }

    #[test]
    fn delay_pattern_picks_last_reached_group() {
        let policy = RedeliveryPolicy::default()
            .with_delay_pattern("2:1000;5:5000")
            .unwrap();
        assert_eq!(policy.calculate_delay(Duration::ZERO, 1), Duration::ZERO);
        assert_eq!(policy.calculate_delay(Duration::ZERO, 2), ms(1000));
        assert_eq!(policy.calculate_delay(ms(1000), 4), ms(1000));
        assert_eq!(policy.calculate_delay(ms(1000), 5), ms(5000));
        assert_eq!(policy.calculate_delay(ms(5000), 50), ms(5000));
    }

    #[test]
    fn malformed_patterns_are_rejected() {
        for pattern in ["", "5", "x:100", "3:-1"] {
            assert!(
                matches!(
                    DelayPattern::parse(pattern),
                    Err(ConfigError::InvalidDelayPattern { .. })
                ),
                "{pattern:?}"
            );
        }
    }
}

//! Table-driven retry policy with configurable backoff and jitter strategies.
//!
//! Each stage owns an ordered list of [`RetryRule`]s. The first rule whose
//! error kinds match a classified failure decides whether the failure is
//! retried and after which delay. Failures no rule matches are not retryable.

use crate::core::{ClassifiedError, ErrorKind, StageName};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Retries allowed for a rate-limited Persist call.
pub const DEFAULT_RATE_LIMIT_MAX_RETRIES: u32 = 5;
/// Delay before the first rate-limit retry.
pub const DEFAULT_RATE_LIMIT_INITIAL_DELAY_MS: u64 = 1_000;
/// Delay before every later rate-limit retry.
pub const DEFAULT_RATE_LIMIT_WAIT_MS: u64 = 10_000;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^n
    Exponential,
    /// delay = base * (n + 1)
    Linear,
    /// delay = base (constant)
    #[default]
    Constant,
}

/// Jitter strategy to prevent thundering herd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    #[default]
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    Equal,
    /// min(max, random(base, prev * 3))
    Decorrelated,
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// No more retries, give up.
    GiveUp,
    /// Don't retry, the error is not retryable.
    NotRetryable,
}

/// One retry rule: which error kinds it covers and how they are retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRule {
    /// Error kinds the rule applies to.
    pub error_kinds: Vec<ErrorKind>,
    /// Maximum number of retries (not counting the first attempt).
    pub max_retries: u32,
    /// Delay before the first retry; falls back to the backoff if unset.
    pub initial_delay_ms: Option<u64>,
    /// Base delay fed to the backoff strategy in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub backoff_strategy: BackoffStrategy,
    /// Jitter strategy.
    pub jitter_strategy: JitterStrategy,
    /// Use the stage's backoff hint (capped) instead of the computed delay.
    pub honor_backoff_hint: bool,
}

impl RetryRule {
    /// Creates a rule for the given kinds with a constant 1 s delay and no
    /// jitter.
    #[must_use]
    pub fn new(error_kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        Self {
            error_kinds: error_kinds.into_iter().collect(),
            max_retries: 3,
            initial_delay_ms: None,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_strategy: BackoffStrategy::Constant,
            jitter_strategy: JitterStrategy::None,
            honor_backoff_hint: false,
        }
    }

    /// The rule used for a rate-limited Persist call: five retries, 1 s
    /// before the first, 10 s before each later one.
    #[must_use]
    pub fn rate_limit() -> Self {
        Self::new([ErrorKind::HealthLakePostTooManyRequests])
            .with_max_retries(DEFAULT_RATE_LIMIT_MAX_RETRIES)
            .with_initial_delay_ms(DEFAULT_RATE_LIMIT_INITIAL_DELAY_MS)
            .with_base_delay_ms(DEFAULT_RATE_LIMIT_WAIT_MS)
            .with_max_delay_ms(DEFAULT_RATE_LIMIT_WAIT_MS)
    }

    /// Sets the maximum retries.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the first-retry delay.
    #[must_use]
    pub fn with_initial_delay_ms(mut self, delay: u64) -> Self {
        self.initial_delay_ms = Some(delay);
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }

    /// Prefer the stage's backoff hint when present.
    #[must_use]
    pub fn with_backoff_hint(mut self, honor: bool) -> Self {
        self.honor_backoff_hint = honor;
        self
    }

    /// Returns true if the rule covers `kind`.
    #[must_use]
    pub fn matches(&self, kind: &ErrorKind) -> bool {
        self.error_kinds.contains(kind)
    }

    /// Backoff delay for the `n`-th computed step (0-based), before jitter.
    fn backoff_delay(&self, n: u32) -> u64 {
        let base = self.base_delay_ms;
        let max = self.max_delay_ms;

        match self.backoff_strategy {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(n)).min(max),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(n) + 1).min(max),
            BackoffStrategy::Constant => base.min(max),
        }
    }

    /// Calculates the delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);

        // The initial delay stands in for the first step of the backoff.
        let (delay, step) = match self.initial_delay_ms {
            Some(initial) if attempt == 1 => {
                return Duration::from_millis(initial.min(self.max_delay_ms));
            }
            Some(_) => (self.backoff_delay(attempt - 2), attempt - 2),
            None => (self.backoff_delay(attempt - 1), attempt - 1),
        };

        let jittered = match self.jitter_strategy {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                let base = self.base_delay_ms;
                let prev = if step == 0 {
                    base
                } else {
                    self.backoff_delay(step - 1)
                };
                let upper = prev.saturating_mul(3).min(self.max_delay_ms);
                if upper <= base {
                    base.min(self.max_delay_ms)
                } else {
                    rand::thread_rng().gen_range(base..=upper)
                }
            }
        };

        Duration::from_millis(jittered)
    }
}

/// Per-stage retry rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    rules: HashMap<StageName, Vec<RetryRule>>,
}

impl Default for RetryPolicy {
    /// Retries rate-limited Persist calls; nothing else is retried.
    fn default() -> Self {
        Self::empty().with_rule(StageName::Persist, RetryRule::rate_limit())
    }
}

impl RetryPolicy {
    /// A policy that retries nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// Appends a rule for `stage`. Earlier rules take precedence.
    #[must_use]
    pub fn with_rule(mut self, stage: StageName, rule: RetryRule) -> Self {
        self.add_rule(stage, rule);
        self
    }

    /// Appends a rule for `stage`.
    pub fn add_rule(&mut self, stage: StageName, rule: RetryRule) {
        self.rules.entry(stage).or_default().push(rule);
    }

    /// Puts `rule` ahead of any existing rule for `stage`.
    pub fn prepend_rule(&mut self, stage: StageName, rule: RetryRule) {
        self.rules.entry(stage).or_default().insert(0, rule);
    }

    /// Rules registered for `stage`.
    #[must_use]
    pub fn rules_for(&self, stage: StageName) -> &[RetryRule] {
        self.rules.get(&stage).map_or(&[], Vec::as_slice)
    }

    /// The rule that governs `kind` at `stage`, if any.
    #[must_use]
    pub fn rule_for(&self, stage: StageName, kind: &ErrorKind) -> Option<&RetryRule> {
        self.rules_for(stage).iter().find(|rule| rule.matches(kind))
    }

    /// Decides whether retry number `attempt` (1-based) of `stage` should
    /// happen for a failure of `kind`.
    #[must_use]
    pub fn should_retry(&self, stage: StageName, attempt: u32, kind: &ErrorKind) -> RetryDecision {
        let Some(rule) = self.rule_for(stage, kind) else {
            return RetryDecision::NotRetryable;
        };

        if attempt > rule.max_retries {
            return RetryDecision::GiveUp;
        }

        RetryDecision::Retry(rule.calculate_delay(attempt))
    }

    /// Like [`should_retry`](Self::should_retry), honouring the error's
    /// backoff hint when the matching rule allows it.
    #[must_use]
    pub fn decide(&self, stage: StageName, attempt: u32, error: &ClassifiedError) -> RetryDecision {
        let decision = self.should_retry(stage, attempt, &error.kind);

        match (decision, error.backoff_hint, self.rule_for(stage, &error.kind)) {
            (RetryDecision::Retry(_), Some(hint), Some(rule)) if rule.honor_backoff_hint => {
                RetryDecision::Retry(hint.min(Duration::from_millis(rule.max_delay_ms)))
            }
            (decision, _, _) => decision,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_policy_rate_limit_schedule() {
        let policy = RetryPolicy::default();
        let kind = ErrorKind::HealthLakePostTooManyRequests;

        assert_eq!(
            policy.should_retry(StageName::Persist, 1, &kind),
            RetryDecision::Retry(Duration::from_secs(1))
        );
        for attempt in 2..=5 {
            assert_eq!(
                policy.should_retry(StageName::Persist, attempt, &kind),
                RetryDecision::Retry(Duration::from_secs(10))
            );
        }
        assert_eq!(
            policy.should_retry(StageName::Persist, 6, &kind),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_default_policy_other_kinds_not_retryable() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.should_retry(StageName::Persist, 1, &ErrorKind::HealthLakePost),
            RetryDecision::NotRetryable
        );
        assert_eq!(
            policy.should_retry(
                StageName::Convert,
                1,
                &ErrorKind::HealthLakePostTooManyRequests
            ),
            RetryDecision::NotRetryable
        );
        assert_eq!(
            policy.should_retry(StageName::Validate, 1, &ErrorKind::InvalidFile),
            RetryDecision::NotRetryable
        );
    }

    #[test]
    fn test_rules_added_without_touching_defaults() {
        let policy = RetryPolicy::default().with_rule(
            StageName::Convert,
            RetryRule::new([ErrorKind::Converter])
                .with_max_retries(2)
                .with_base_delay_ms(100),
        );

        assert_eq!(
            policy.should_retry(StageName::Convert, 2, &ErrorKind::Converter),
            RetryDecision::Retry(Duration::from_millis(100))
        );
        assert_eq!(
            policy.should_retry(StageName::Convert, 3, &ErrorKind::Converter),
            RetryDecision::GiveUp
        );
        assert_eq!(policy.rules_for(StageName::Persist).len(), 1);
    }

    #[test]
    fn test_calculate_delay_exponential_no_jitter() {
        let rule = RetryRule::new([ErrorKind::Converter])
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Exponential);

        assert_eq!(rule.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(rule.calculate_delay(2), Duration::from_millis(200));
        assert_eq!(rule.calculate_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_calculate_delay_linear_after_initial() {
        let rule = RetryRule::new([ErrorKind::Converter])
            .with_initial_delay_ms(50)
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Linear);

        assert_eq!(rule.calculate_delay(1), Duration::from_millis(50));
        assert_eq!(rule.calculate_delay(2), Duration::from_millis(100));
        assert_eq!(rule.calculate_delay(3), Duration::from_millis(200));
    }

    #[test]
    fn test_calculate_delay_capped_at_max() {
        let rule = RetryRule::new([ErrorKind::Converter])
            .with_base_delay_ms(1000)
            .with_max_delay_ms(5000)
            .with_backoff(BackoffStrategy::Exponential);

        assert_eq!(rule.calculate_delay(11), Duration::from_millis(5000));
    }

    #[test]
    fn test_calculate_delay_full_jitter_bounded() {
        let rule = RetryRule::new([ErrorKind::Converter])
            .with_base_delay_ms(100)
            .with_jitter(JitterStrategy::Full);

        for _ in 0..10 {
            assert!(rule.calculate_delay(1) <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_calculate_delay_decorrelated_bounded() {
        let rule = RetryRule::new([ErrorKind::Converter])
            .with_base_delay_ms(100)
            .with_max_delay_ms(250)
            .with_backoff(BackoffStrategy::Exponential)
            .with_jitter(JitterStrategy::Decorrelated);

        for attempt in 1..=4 {
            let delay = rule.calculate_delay(attempt);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(250));
        }
    }

    #[test]
    fn test_backoff_hint_honoured_and_capped() {
        let policy = RetryPolicy::empty().with_rule(
            StageName::Persist,
            RetryRule::rate_limit().with_backoff_hint(true),
        );

        let hinted = ClassifiedError::rate_limited("429")
            .with_backoff_hint(Duration::from_millis(2500));
        assert_eq!(
            policy.decide(StageName::Persist, 3, &hinted),
            RetryDecision::Retry(Duration::from_millis(2500))
        );

        let too_long = ClassifiedError::rate_limited("429")
            .with_backoff_hint(Duration::from_secs(60));
        assert_eq!(
            policy.decide(StageName::Persist, 3, &too_long),
            RetryDecision::Retry(Duration::from_secs(10))
        );

        // The default rule ignores hints.
        assert_eq!(
            RetryPolicy::default().decide(StageName::Persist, 1, &hinted),
            RetryDecision::Retry(Duration::from_secs(1))
        );
    }

    #[test]
    fn test_rule_serializes_with_wire_kind_names() {
        let json = serde_json::to_value(RetryRule::rate_limit()).unwrap();
        assert_eq!(json["error_kinds"][0], "HealthLakePostTooManyRequestsError");
        assert_eq!(json["backoff_strategy"], "constant");
    }
}

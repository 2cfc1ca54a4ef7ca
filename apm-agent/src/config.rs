//! Agent configuration.
//!
//! [`Config`] holds the settings the tracing core reads. Defaults are pure;
//! [`Config::from_env`] overrides them from `APM_AGENT_*` environment
//! variables, logging and ignoring values that do not parse.
//!
//! Settings can change while the application runs. The tracer never caches a
//! [`Config`]; it reads [`ConfigHandle::current`] each time a transaction
//! begins, and the transaction keeps the snapshot it started with.
use crate::error::{AgentError, AgentResult};
use crate::export::Processor;
use crate::apm_warn;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Probability of sampling a new trace.
pub(crate) const APM_AGENT_TRANSACTION_SAMPLE_RATE: &str = "APM_AGENT_TRANSACTION_SAMPLE_RATE";
/// Maximum spans recorded per transaction, `0` for unlimited.
pub(crate) const APM_AGENT_TRANSACTION_MAX_SPANS: &str = "APM_AGENT_TRANSACTION_MAX_SPANS";
pub(crate) const APM_AGENT_TRANSACTION_MAX_SPANS_DEFAULT: usize = 500;
pub(crate) const APM_AGENT_SPAN_COMPRESSION_ENABLED: &str = "APM_AGENT_SPAN_COMPRESSION_ENABLED";
pub(crate) const APM_AGENT_SPAN_COMPRESSION_EXACT_MATCH_MAX_DURATION: &str =
    "APM_AGENT_SPAN_COMPRESSION_EXACT_MATCH_MAX_DURATION";
pub(crate) const APM_AGENT_SPAN_COMPRESSION_SAME_KIND_MAX_DURATION: &str =
    "APM_AGENT_SPAN_COMPRESSION_SAME_KIND_MAX_DURATION";
/// Spans shorter than this get no stack trace. Negative disables stack traces.
pub(crate) const APM_AGENT_SPAN_STACK_TRACE_MIN_DURATION: &str =
    "APM_AGENT_SPAN_STACK_TRACE_MIN_DURATION";
/// Discardable exit spans shorter than this are dropped.
pub(crate) const APM_AGENT_EXIT_SPAN_MIN_DURATION: &str = "APM_AGENT_EXIT_SPAN_MIN_DURATION";
pub(crate) const APM_AGENT_TRACE_CONTINUATION_STRATEGY: &str =
    "APM_AGENT_TRACE_CONTINUATION_STRATEGY";
pub(crate) const APM_AGENT_STACK_TRACE_LIMIT: &str = "APM_AGENT_STACK_TRACE_LIMIT";
pub(crate) const APM_AGENT_STACK_TRACE_LIMIT_DEFAULT: usize = 50;
pub(crate) const APM_AGENT_SANITIZE_FIELD_NAMES: &str = "APM_AGENT_SANITIZE_FIELD_NAMES";
/// Comma separated processor names, applied in order.
pub(crate) const APM_AGENT_PROCESSORS: &str = "APM_AGENT_PROCESSORS";
pub(crate) const APM_AGENT_USE_LEGACY_TRACEPARENT_HEADER: &str =
    "APM_AGENT_USE_LEGACY_TRACEPARENT_HEADER";

const DEFAULT_SANITIZE_FIELD_NAMES: &[&str] = &[
    "password",
    "passwd",
    "pwd",
    "secret",
    "*key",
    "*token*",
    "*session*",
    "*credit*",
    "*card*",
    "*auth*",
    "*principal*",
    "set-cookie",
];

/// How a transaction treats an incoming trace parent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TraceContinuationStrategy {
    /// Join the incoming trace.
    #[default]
    Continue,
    /// Always start a new trace and link the incoming one.
    Restart,
    /// Start a new trace, linking the incoming one, unless the caller was
    /// itself instrumented by this agent (its tracestate has our vendor key).
    RestartExternal,
}

impl FromStr for TraceContinuationStrategy {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continue" => Ok(TraceContinuationStrategy::Continue),
            "restart" => Ok(TraceContinuationStrategy::Restart),
            "restart_external" => Ok(TraceContinuationStrategy::RestartExternal),
            _ => Err(AgentError::invalid_config(
                APM_AGENT_TRACE_CONTINUATION_STRATEGY,
                s,
            )),
        }
    }
}

/// Settings read by the tracer and the event pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Probability in `0.0..=1.0` that a new trace is sampled.
    pub transaction_sample_rate: f64,
    /// Maximum spans recorded per transaction; `0` means unlimited.
    pub transaction_max_spans: usize,
    /// Whether runs of similar exit spans are merged into composites.
    pub span_compression_enabled: bool,
    /// Longest span eligible for `exact_match` compression.
    pub span_compression_exact_match_max_duration: Duration,
    /// Longest span eligible for `same_kind` compression.
    pub span_compression_same_kind_max_duration: Duration,
    /// Shortest span that gets a stack trace; `None` disables stack traces.
    pub span_stack_trace_min_duration: Option<Duration>,
    /// Discardable exit spans shorter than this are dropped.
    pub exit_span_min_duration: Duration,
    /// How incoming trace parents are treated.
    pub trace_continuation_strategy: TraceContinuationStrategy,
    /// Maximum frames per stack trace; `0` disables stack traces.
    pub stack_trace_limit: usize,
    /// Field name patterns redacted by the sanitizing processors.
    pub sanitize_field_names: Vec<String>,
    /// Processors applied to events before export, in order.
    pub processors: Vec<Processor>,
    /// Also send the legacy trace parent header on outgoing requests.
    pub use_legacy_traceparent_header: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            transaction_sample_rate: 1.0,
            transaction_max_spans: APM_AGENT_TRANSACTION_MAX_SPANS_DEFAULT,
            span_compression_enabled: true,
            span_compression_exact_match_max_duration: Duration::from_millis(50),
            span_compression_same_kind_max_duration: Duration::ZERO,
            span_stack_trace_min_duration: Some(Duration::from_millis(5)),
            exit_span_min_duration: Duration::ZERO,
            trace_continuation_strategy: TraceContinuationStrategy::Continue,
            stack_trace_limit: APM_AGENT_STACK_TRACE_LIMIT_DEFAULT,
            sanitize_field_names: DEFAULT_SANITIZE_FIELD_NAMES
                .iter()
                .map(|name| name.to_string())
                .collect(),
            processors: Processor::defaults(),
            use_legacy_traceparent_header: false,
        }
    }
}

impl Config {
    /// Defaults overridden by the `APM_AGENT_*` environment variables.
    ///
    /// Values that fail to parse are logged and the default is kept.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Some(rate) = read_env(APM_AGENT_TRANSACTION_SAMPLE_RATE, parse_sample_rate) {
            config.transaction_sample_rate = rate;
        }
        if let Some(max_spans) = read_env(APM_AGENT_TRANSACTION_MAX_SPANS, |value| {
            // negative means unlimited, like zero
            value
                .trim()
                .parse::<i64>()
                .map(|max| usize::try_from(max).unwrap_or(0))
                .map_err(|_| AgentError::invalid_config(APM_AGENT_TRANSACTION_MAX_SPANS, value))
        }) {
            config.transaction_max_spans = max_spans;
        }
        if let Some(enabled) = read_env(APM_AGENT_SPAN_COMPRESSION_ENABLED, |value| {
            parse_bool(APM_AGENT_SPAN_COMPRESSION_ENABLED, value)
        }) {
            config.span_compression_enabled = enabled;
        }
        if let Some(max) = read_env(APM_AGENT_SPAN_COMPRESSION_EXACT_MATCH_MAX_DURATION, |value| {
            parse_non_negative_duration(APM_AGENT_SPAN_COMPRESSION_EXACT_MATCH_MAX_DURATION, value)
        }) {
            config.span_compression_exact_match_max_duration = max;
        }
        if let Some(max) = read_env(APM_AGENT_SPAN_COMPRESSION_SAME_KIND_MAX_DURATION, |value| {
            parse_non_negative_duration(APM_AGENT_SPAN_COMPRESSION_SAME_KIND_MAX_DURATION, value)
        }) {
            config.span_compression_same_kind_max_duration = max;
        }
        if let Some(min) = read_env(APM_AGENT_SPAN_STACK_TRACE_MIN_DURATION, |value| {
            parse_duration(APM_AGENT_SPAN_STACK_TRACE_MIN_DURATION, value)
        }) {
            config.span_stack_trace_min_duration = min.to_duration();
        }
        if let Some(min) = read_env(APM_AGENT_EXIT_SPAN_MIN_DURATION, |value| {
            parse_non_negative_duration(APM_AGENT_EXIT_SPAN_MIN_DURATION, value)
        }) {
            config.exit_span_min_duration = min;
        }
        if let Some(strategy) = read_env(APM_AGENT_TRACE_CONTINUATION_STRATEGY, |value| {
            value.parse::<TraceContinuationStrategy>()
        }) {
            config.trace_continuation_strategy = strategy;
        }
        if let Some(limit) = read_env(APM_AGENT_STACK_TRACE_LIMIT, |value| {
            value
                .trim()
                .parse::<i64>()
                .map(|limit| usize::try_from(limit).unwrap_or(usize::MAX))
                .map_err(|_| AgentError::invalid_config(APM_AGENT_STACK_TRACE_LIMIT, value))
        }) {
            config.stack_trace_limit = limit;
        }
        if let Some(names) = read_env(APM_AGENT_SANITIZE_FIELD_NAMES, |value| {
            Ok::<_, AgentError>(split_list(value))
        }) {
            config.sanitize_field_names = names;
        }
        if let Some(processors) = read_env(APM_AGENT_PROCESSORS, |value| {
            split_list(value)
                .iter()
                .map(|name| name.parse::<Processor>())
                .collect::<AgentResult<Vec<_>>>()
        }) {
            config.processors = processors;
        }
        if let Some(legacy) = read_env(APM_AGENT_USE_LEGACY_TRACEPARENT_HEADER, |value| {
            parse_bool(APM_AGENT_USE_LEGACY_TRACEPARENT_HEADER, value)
        }) {
            config.use_legacy_traceparent_header = legacy;
        }

        config
    }
}

fn read_env<T>(key: &str, parse: impl FnOnce(&str) -> AgentResult<T>) -> Option<T> {
    let value = env::var(key).ok()?;
    match parse(&value) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            apm_warn!(
                name: "Config.InvalidValue",
                key = key,
                value = value.as_str(),
                error = err.to_string()
            );
            None
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

fn parse_bool(key: &str, value: &str) -> AgentResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(AgentError::invalid_config(key, value)),
    }
}

/// Parses a sample rate and rounds it to four decimals. A positive rate
/// never rounds down to zero.
pub(crate) fn parse_sample_rate(value: &str) -> AgentResult<f64> {
    match value.trim().parse::<f64>() {
        Ok(rate) if (0.0..=1.0).contains(&rate) => Ok(round_sample_rate(rate)),
        _ => Err(AgentError::invalid_config(
            APM_AGENT_TRANSACTION_SAMPLE_RATE,
            value,
        )),
    }
}

pub(crate) fn round_sample_rate(rate: f64) -> f64 {
    if rate.is_nan() {
        return 0.0;
    }
    let rate = rate.clamp(0.0, 1.0);
    let rounded = (rate * 10_000.0).round() / 10_000.0;
    if rounded == 0.0 && rate > 0.0 {
        0.0001
    } else {
        rounded
    }
}

/// A duration setting that may be negative.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum SignedDuration {
    Positive(Duration),
    Negative(Duration),
}

impl SignedDuration {
    fn to_duration(self) -> Option<Duration> {
        match self {
            SignedDuration::Positive(duration) => Some(duration),
            SignedDuration::Negative(_) => None,
        }
    }
}

/// Parses `"5ms"`, `"1.5s"`, `"2m"`, `"300us"` or a bare number of
/// milliseconds. A leading `-` is allowed.
pub(crate) fn parse_duration(key: &str, value: &str) -> AgentResult<SignedDuration> {
    let invalid = || AgentError::invalid_config(key, value);
    let trimmed = value.trim().to_ascii_lowercase();
    let (negative, unsigned) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.as_str()),
    };
    let (number, micros_per_unit) = if let Some(n) = unsigned.strip_suffix("us") {
        (n, 1.0)
    } else if let Some(n) = unsigned.strip_suffix("ms") {
        (n, 1_000.0)
    } else if let Some(n) = unsigned.strip_suffix('s') {
        (n, 1_000_000.0)
    } else if let Some(n) = unsigned.strip_suffix('m') {
        (n, 60_000_000.0)
    } else {
        (unsigned, 1_000.0)
    };
    let amount = number.trim().parse::<f64>().map_err(|_| invalid())?;
    if !amount.is_finite() || amount < 0.0 {
        return Err(invalid());
    }
    let duration = Duration::from_micros((amount * micros_per_unit).round() as u64);
    Ok(if negative {
        SignedDuration::Negative(duration)
    } else {
        SignedDuration::Positive(duration)
    })
}

fn parse_non_negative_duration(key: &str, value: &str) -> AgentResult<Duration> {
    match parse_duration(key, value)? {
        SignedDuration::Positive(duration) => Ok(duration),
        SignedDuration::Negative(_) => Err(AgentError::invalid_config(key, value)),
    }
}

/// Shared, updatable configuration.
///
/// Cloning the handle shares the underlying configuration. Updates become
/// visible to transactions that begin afterwards.
#[derive(Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<Config>>>,
    version: Arc<AtomicU64>,
}

impl ConfigHandle {
    /// Wraps a configuration.
    pub fn new(config: Config) -> Self {
        ConfigHandle {
            current: Arc::new(RwLock::new(Arc::new(config))),
            version: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The configuration in effect right now.
    pub fn current(&self) -> Arc<Config> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Applies a change on top of the current configuration.
    pub fn update(&self, f: impl FnOnce(&mut Config)) {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Config::clone(&guard);
        f(&mut next);
        *guard = Arc::new(next);
        self.version.fetch_add(1, Ordering::Release);
    }

    /// Replaces the configuration.
    pub fn replace(&self, config: Config) {
        self.update(|current| *current = config);
    }

    /// Number of updates applied since the handle was created.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        ConfigHandle::new(Config::default())
    }
}

impl From<Config> for ConfigHandle {
    fn from(config: Config) -> Self {
        ConfigHandle::new(config)
    }
}

impl fmt::Debug for ConfigHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigHandle")
            .field("version", &self.version())
            .field("current", &self.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const ALL_VARS: [&str; 12] = [
        APM_AGENT_TRANSACTION_SAMPLE_RATE,
        APM_AGENT_TRANSACTION_MAX_SPANS,
        APM_AGENT_SPAN_COMPRESSION_ENABLED,
        APM_AGENT_SPAN_COMPRESSION_EXACT_MATCH_MAX_DURATION,
        APM_AGENT_SPAN_COMPRESSION_SAME_KIND_MAX_DURATION,
        APM_AGENT_SPAN_STACK_TRACE_MIN_DURATION,
        APM_AGENT_EXIT_SPAN_MIN_DURATION,
        APM_AGENT_TRACE_CONTINUATION_STRATEGY,
        APM_AGENT_STACK_TRACE_LIMIT,
        APM_AGENT_SANITIZE_FIELD_NAMES,
        APM_AGENT_PROCESSORS,
        APM_AGENT_USE_LEGACY_TRACEPARENT_HEADER,
    ];

    #[test]
    fn from_env_without_vars_is_default() {
        let config = temp_env::with_vars_unset(ALL_VARS, Config::from_env);
        assert_eq!(config, Config::default());
        assert_eq!(config.transaction_max_spans, 500);
        assert_eq!(
            config.span_stack_trace_min_duration,
            Some(Duration::from_millis(5))
        );
    }

    #[test]
    fn from_env_reads_all_settings() {
        let vars = vec![
            (APM_AGENT_TRANSACTION_SAMPLE_RATE, Some("0.25")),
            (APM_AGENT_TRANSACTION_MAX_SPANS, Some("10")),
            (APM_AGENT_SPAN_COMPRESSION_ENABLED, Some("false")),
            (APM_AGENT_SPAN_COMPRESSION_EXACT_MATCH_MAX_DURATION, Some("20ms")),
            (APM_AGENT_SPAN_COMPRESSION_SAME_KIND_MAX_DURATION, Some("1s")),
            (APM_AGENT_SPAN_STACK_TRACE_MIN_DURATION, Some("-1ms")),
            (APM_AGENT_EXIT_SPAN_MIN_DURATION, Some("500us")),
            (APM_AGENT_TRACE_CONTINUATION_STRATEGY, Some("restart_external")),
            (APM_AGENT_STACK_TRACE_LIMIT, Some("5")),
            (APM_AGENT_SANITIZE_FIELD_NAMES, Some("secret, *pin*")),
            (APM_AGENT_PROCESSORS, Some("sanitize_http_headers")),
            (APM_AGENT_USE_LEGACY_TRACEPARENT_HEADER, Some("true")),
        ];
        let config = temp_env::with_vars(vars, Config::from_env);

        assert_eq!(config.transaction_sample_rate, 0.25);
        assert_eq!(config.transaction_max_spans, 10);
        assert!(!config.span_compression_enabled);
        assert_eq!(
            config.span_compression_exact_match_max_duration,
            Duration::from_millis(20)
        );
        assert_eq!(
            config.span_compression_same_kind_max_duration,
            Duration::from_secs(1)
        );
        assert_eq!(config.span_stack_trace_min_duration, None);
        assert_eq!(config.exit_span_min_duration, Duration::from_micros(500));
        assert_eq!(
            config.trace_continuation_strategy,
            TraceContinuationStrategy::RestartExternal
        );
        assert_eq!(config.stack_trace_limit, 5);
        assert_eq!(config.sanitize_field_names, vec!["secret", "*pin*"]);
        assert_eq!(config.processors, vec![Processor::SanitizeHttpHeaders]);
        assert!(config.use_legacy_traceparent_header);
    }

    #[test]
    fn invalid_env_values_keep_defaults() {
        let vars = vec![
            (APM_AGENT_TRANSACTION_SAMPLE_RATE, Some("1.5")),
            (APM_AGENT_TRANSACTION_MAX_SPANS, Some("many")),
            (APM_AGENT_SPAN_COMPRESSION_ENABLED, Some("perhaps")),
            (APM_AGENT_EXIT_SPAN_MIN_DURATION, Some("-5ms")),
            (APM_AGENT_TRACE_CONTINUATION_STRATEGY, Some("fork")),
            (APM_AGENT_PROCESSORS, Some("sanitize_http_headers,unknown")),
        ];
        let config = temp_env::with_vars(vars, Config::from_env);
        let defaults = Config::default();

        assert_eq!(config.transaction_sample_rate, defaults.transaction_sample_rate);
        assert_eq!(config.transaction_max_spans, defaults.transaction_max_spans);
        assert_eq!(config.span_compression_enabled, defaults.span_compression_enabled);
        assert_eq!(config.exit_span_min_duration, defaults.exit_span_min_duration);
        assert_eq!(
            config.trace_continuation_strategy,
            defaults.trace_continuation_strategy
        );
        assert_eq!(config.processors, defaults.processors);
    }

    #[test]
    fn negative_max_spans_means_unlimited() {
        let config = temp_env::with_var(APM_AGENT_TRANSACTION_MAX_SPANS, Some("-1"), Config::from_env);
        assert_eq!(config.transaction_max_spans, 0);
    }

    #[rstest]
    #[case("5ms", SignedDuration::Positive(Duration::from_millis(5)))]
    #[case("5", SignedDuration::Positive(Duration::from_millis(5)))]
    #[case("1.5s", SignedDuration::Positive(Duration::from_millis(1500)))]
    #[case("2m", SignedDuration::Positive(Duration::from_secs(120)))]
    #[case("250us", SignedDuration::Positive(Duration::from_micros(250)))]
    #[case(" 10MS ", SignedDuration::Positive(Duration::from_millis(10)))]
    #[case("-1ms", SignedDuration::Negative(Duration::from_millis(1)))]
    fn parses_durations(#[case] raw: &str, #[case] expected: SignedDuration) {
        assert_eq!(parse_duration("test", raw).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("ms")]
    #[case("5h")]
    #[case("--5ms")]
    #[case("NaNms")]
    fn rejects_bad_durations(#[case] raw: &str) {
        assert!(parse_duration("test", raw).is_err());
    }

    #[rstest]
    #[case("1", 1.0)]
    #[case("0", 0.0)]
    #[case("0.12345", 0.1235)]
    #[case("0.00001", 0.0001)]
    #[case("0.5", 0.5)]
    fn sample_rate_is_rounded(#[case] raw: &str, #[case] expected: f64) {
        assert_eq!(parse_sample_rate(raw).unwrap(), expected);
    }

    #[test]
    fn handle_updates_are_visible_to_later_reads() {
        let handle = ConfigHandle::default();
        let before = handle.current();
        let clone = handle.clone();

        clone.update(|config| config.transaction_sample_rate = 0.0);

        assert_eq!(before.transaction_sample_rate, 1.0);
        assert_eq!(handle.current().transaction_sample_rate, 0.0);
        assert_eq!(handle.version(), 1);

        handle.replace(Config::default());
        assert_eq!(clone.current().transaction_sample_rate, 1.0);
        assert_eq!(clone.version(), 2);
    }
}

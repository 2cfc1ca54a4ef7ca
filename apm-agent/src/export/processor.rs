//! Redaction applied to events before they leave the process.
//!
//! Processors are a fixed registry of [`Processor`] variants, selected by
//! name through [`Config::processors`](crate::Config). Each one replaces the
//! values of sensitive fields in the request and response context of
//! transactions and errors with `[REDACTED]`. Field names are matched
//! case-insensitively against [`Config::sanitize_field_names`](crate::Config),
//! where `*` matches any run of characters.
use crate::error::AgentError;
use crate::export::Event;
use crate::{apm_error, Config};
use serde_json::{Map, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;

/// Replacement for redacted values.
pub const REDACTED: &str = "[REDACTED]";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// A built-in event processor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Processor {
    /// Redacts request and response headers.
    SanitizeHttpHeaders,
    /// Redacts request cookies, both parsed and in the `cookie` header.
    SanitizeHttpCookies,
    /// Redacts fields of form encoded or structured request bodies.
    SanitizeHttpRequestBody,
    /// Redacts query string parameters.
    SanitizeHttpQueryString,
}

impl Processor {
    /// All built-in processors, in the order they run by default.
    pub fn defaults() -> Vec<Processor> {
        vec![
            Processor::SanitizeHttpHeaders,
            Processor::SanitizeHttpCookies,
            Processor::SanitizeHttpRequestBody,
            Processor::SanitizeHttpQueryString,
        ]
    }

    /// The name the processor is configured by.
    pub fn name(&self) -> &'static str {
        match self {
            Processor::SanitizeHttpHeaders => "sanitize_http_headers",
            Processor::SanitizeHttpCookies => "sanitize_http_cookies",
            Processor::SanitizeHttpRequestBody => "sanitize_http_request_body",
            Processor::SanitizeHttpQueryString => "sanitize_http_query_string",
        }
    }

    /// Applies the processor to one event. Spans are left alone.
    pub fn apply(&self, event: &mut Event, fields: &FieldMatcher) {
        if matches!(event, Event::Span(_)) {
            return;
        }
        let Some(context) = event.context_mut() else {
            return;
        };
        match self {
            Processor::SanitizeHttpHeaders => {
                for section in ["request", "response"] {
                    if let Some(headers) = object_at(context, &[section, "headers"]) {
                        redact_keys(headers, fields);
                    }
                }
            }
            Processor::SanitizeHttpCookies => {
                if let Some(cookies) = object_at(context, &["request", "cookies"]) {
                    redact_keys(cookies, fields);
                }
                if let Some(headers) = object_at(context, &["request", "headers"]) {
                    for (name, value) in headers.iter_mut() {
                        if name.eq_ignore_ascii_case("cookie") {
                            if let Value::String(cookie) = value {
                                *cookie = redact_pairs(cookie, "; ", fields);
                            }
                        }
                    }
                }
            }
            Processor::SanitizeHttpRequestBody => {
                let is_form = object_at(context, &["request", "headers"]).is_some_and(|headers| {
                    headers.iter().any(|(name, value)| {
                        name.eq_ignore_ascii_case("content-type")
                            && value.as_str().is_some_and(|v| v.starts_with(FORM_CONTENT_TYPE))
                    })
                });
                let Some(request) = object_at(context, &["request"]) else {
                    return;
                };
                match request.get_mut("body") {
                    Some(Value::Object(body)) => redact_keys(body, fields),
                    Some(Value::String(body)) if is_form => *body = redact_pairs(body, "&", fields),
                    _ => {}
                }
            }
            Processor::SanitizeHttpQueryString => {
                let Some(url) = object_at(context, &["request", "url"]) else {
                    return;
                };
                let Some(search) = url.get("search").and_then(Value::as_str).map(str::to_owned)
                else {
                    return;
                };
                if !search.contains('=') {
                    return;
                }
                let (prefix, query) = match search.strip_prefix('?') {
                    Some(query) => ("?", query),
                    None => ("", search.as_str()),
                };
                let sanitized = format!("{prefix}{}", redact_pairs(query, "&", fields));
                if let Some(Value::String(full)) = url.get_mut("full") {
                    *full = full.replace(&search, &sanitized);
                }
                url.insert("search".into(), Value::String(sanitized));
            }
        }
    }
}

impl FromStr for Processor {
    type Err = AgentError;

    /// Accepts the processor name, optionally qualified with a dotted path.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().rsplit('.').next().unwrap_or_default();
        Processor::defaults()
            .into_iter()
            .find(|processor| processor.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| AgentError::invalid_config("processor", s))
    }
}

/// Case-insensitive field name patterns where `*` matches any run of
/// characters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldMatcher {
    patterns: Vec<String>,
}

impl FieldMatcher {
    /// Compiles the given patterns.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        FieldMatcher {
            patterns: patterns
                .into_iter()
                .map(|pattern| pattern.as_ref().trim().to_lowercase())
                .filter(|pattern| !pattern.is_empty())
                .collect(),
        }
    }

    /// Whether `field` matches any pattern.
    pub fn matches(&self, field: &str) -> bool {
        let field = field.trim().to_lowercase();
        self.patterns
            .iter()
            .any(|pattern| wildcard_match(pattern, &field))
    }
}

fn wildcard_match(pattern: &str, text: &str) -> bool {
    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or_default();
    let Some(mut remaining) = text.strip_prefix(first) else {
        return false;
    };
    let mut rest: Vec<&str> = parts.collect();
    let Some(last) = rest.pop() else {
        return remaining.is_empty();
    };
    for middle in rest {
        match remaining.find(middle) {
            Some(index) => remaining = &remaining[index + middle.len()..],
            None => return false,
        }
    }
    remaining.ends_with(last)
}

fn object_at<'a>(context: &'a mut Map<String, Value>, path: &[&str]) -> Option<&'a mut Map<String, Value>> {
    let (first, rest) = path.split_first()?;
    let mut current = context.get_mut(*first)?.as_object_mut()?;
    for key in rest {
        current = current.get_mut(*key)?.as_object_mut()?;
    }
    Some(current)
}

fn redact_keys(map: &mut Map<String, Value>, fields: &FieldMatcher) {
    for (key, value) in map.iter_mut() {
        if fields.matches(key) {
            *value = Value::String(REDACTED.to_owned());
        }
    }
}

/// Redacts the values of `key=value` pairs joined by `separator`.
fn redact_pairs(text: &str, separator: &str, fields: &FieldMatcher) -> String {
    text.split(separator)
        .map(|pair| match pair.split_once('=') {
            Some((key, _)) if fields.matches(key) => format!("{key}={REDACTED}"),
            _ => pair.to_owned(),
        })
        .collect::<Vec<_>>()
        .join(separator)
}

/// The configured processors, applied in order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProcessorChain {
    processors: Vec<Processor>,
    fields: FieldMatcher,
}

impl ProcessorChain {
    /// A chain of `processors` redacting fields matching `sanitize_field_names`.
    pub fn new<S: AsRef<str>>(processors: Vec<Processor>, sanitize_field_names: &[S]) -> Self {
        ProcessorChain {
            processors,
            fields: FieldMatcher::new(sanitize_field_names),
        }
    }

    /// The chain described by a configuration.
    pub fn from_config(config: &Config) -> Self {
        ProcessorChain::new(config.processors.clone(), &config.sanitize_field_names)
    }

    /// Whether the chain has no processors.
    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Runs every processor over the event.
    ///
    /// An event whose processing panics is dropped, never sent half
    /// processed. Other events are unaffected.
    pub fn process(&self, event: Event) -> Option<Event> {
        if self.processors.is_empty() {
            return Some(event);
        }
        let event_type = event.event_type();
        let result = catch_unwind(AssertUnwindSafe(move || {
            let mut event = event;
            for processor in &self.processors {
                processor.apply(&mut event, &self.fields);
            }
            event
        }));
        match result {
            Ok(event) => Some(event),
            Err(_) => {
                apm_error!(
                    name: "ProcessorChain.ProcessorPanicked",
                    event_type = event_type,
                    message = "Event dropped because a processor panicked"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{SpanCount, TransactionRecord};
    use crate::trace::{Outcome, SpanId, TraceId};
    use rstest::rstest;
    use serde_json::json;

    fn transaction_with_context(context: Value) -> Event {
        Event::Transaction(TransactionRecord {
            id: SpanId::from(1),
            trace_id: TraceId::from(1),
            parent_id: None,
            name: "GET /".into(),
            transaction_type: "request".into(),
            result: None,
            outcome: Outcome::Success,
            timestamp: 0,
            duration: 1.0,
            sampled: true,
            sample_rate: Some(1.0),
            span_count: SpanCount::default(),
            dropped_spans_stats: Vec::new(),
            links: Vec::new(),
            context: context.as_object().cloned(),
        })
    }

    fn context_of(event: &Event) -> Value {
        match event {
            Event::Transaction(record) => Value::Object(record.context.clone().unwrap_or_default()),
            _ => Value::Null,
        }
    }

    fn default_chain() -> ProcessorChain {
        ProcessorChain::from_config(&Config::default())
    }

    #[rstest]
    #[case("password", "password", true)]
    #[case("*key", "api_KEY", true)]
    #[case("*key", "keyring", false)]
    #[case("*token*", "x-auth-token-id", true)]
    #[case("set-cookie", "Set-Cookie", true)]
    #[case("pass*word", "pass_the_word", true)]
    #[case("pass*word", "passwords", false)]
    fn wildcard_patterns(#[case] pattern: &str, #[case] field: &str, #[case] expected: bool) {
        assert_eq!(FieldMatcher::new([pattern]).matches(field), expected);
    }

    #[test]
    fn processor_names_resolve() {
        assert_eq!(
            "sanitize_http_headers".parse::<Processor>().unwrap(),
            Processor::SanitizeHttpHeaders
        );
        assert_eq!(
            "agent.processors.sanitize_http_query_string"
                .parse::<Processor>()
                .unwrap(),
            Processor::SanitizeHttpQueryString
        );
        assert!("no_such_processor".parse::<Processor>().is_err());
        for processor in Processor::defaults() {
            assert_eq!(processor.name().parse::<Processor>().unwrap(), processor);
        }
    }

    #[test]
    fn redacts_headers_and_cookies() {
        let event = transaction_with_context(json!({
            "request": {
                "headers": {"Authorization": "Bearer abc", "Accept": "*/*", "Cookie": "sessionid=1; theme=dark"},
                "cookies": {"sessionid": "1", "theme": "dark"}
            },
            "response": {"headers": {"Set-Cookie": "sessionid=2"}}
        }));
        let event = default_chain().process(event).unwrap();
        assert_eq!(
            context_of(&event),
            json!({
                "request": {
                    "headers": {"Authorization": REDACTED, "Accept": "*/*", "Cookie": "sessionid=[REDACTED]; theme=dark"},
                    "cookies": {"sessionid": REDACTED, "theme": "dark"}
                },
                "response": {"headers": {"Set-Cookie": REDACTED}}
            })
        );
    }

    #[test]
    fn redacts_form_body_and_query_string() {
        let event = transaction_with_context(json!({
            "request": {
                "headers": {"content-type": "application/x-www-form-urlencoded; charset=utf-8"},
                "body": "user=joe&password=hunter2",
                "url": {"search": "?q=rust&api_key=123", "full": "http://localhost/search?q=rust&api_key=123"}
            }
        }));
        let event = default_chain().process(event).unwrap();
        let context = context_of(&event);
        assert_eq!(context["request"]["body"], "user=joe&password=[REDACTED]");
        assert_eq!(context["request"]["url"]["search"], "?q=rust&api_key=[REDACTED]");
        assert_eq!(
            context["request"]["url"]["full"],
            "http://localhost/search?q=rust&api_key=[REDACTED]"
        );
    }

    #[test]
    fn leaves_non_form_string_bodies_alone() {
        let event = transaction_with_context(json!({
            "request": {"headers": {"content-type": "text/plain"}, "body": "password=visible"}
        }));
        let event = default_chain().process(event).unwrap();
        assert_eq!(context_of(&event)["request"]["body"], "password=visible");
    }

    #[test]
    fn structured_body_keys_are_redacted() {
        let event = transaction_with_context(json!({
            "request": {"body": {"card_number": "4111", "amount": 10}}
        }));
        let event = default_chain().process(event).unwrap();
        assert_eq!(
            context_of(&event)["request"]["body"],
            json!({"card_number": REDACTED, "amount": 10})
        );
    }

    #[test]
    fn empty_chain_passes_events_through() {
        let chain = ProcessorChain::new(Vec::new(), &["password"]);
        assert!(chain.is_empty());
        let event = transaction_with_context(json!({"request": {"headers": {"password": "x"}}}));
        assert_eq!(chain.process(event.clone()), Some(event));
    }
}

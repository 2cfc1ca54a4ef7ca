//! Trace context propagated between services.
//!
//! A [`TraceParent`] is the identifier set carried by the `traceparent`
//! header: version, trace id, parent span id and trace options. It also
//! keeps the raw `tracestate` header and the agent's own vendor entries
//! inside it (`es=s:0.5;k:v`), which carry the sample rate decided at the
//! root of the trace.
//!
//! Header values look like
//!
//! `traceparent: 00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01`
//!
//! `tracestate: es=s:0.5,vendor=opaque`
use crate::trace::{SpanId, TraceFlags, TraceId};
use crate::{apm_debug, apm_warn};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

/// Standard W3C header name.
pub const TRACEPARENT_HEADER: &str = "traceparent";
/// Header name used by older agents.
pub const TRACEPARENT_LEGACY_HEADER: &str = "elastic-apm-traceparent";
/// Vendor state header name.
pub const TRACESTATE_HEADER: &str = "tracestate";

const VENDOR_KEY: &str = "es";
pub(crate) const SAMPLE_RATE_KEY: &str = "s";
const MAX_VENDOR_VALUE_LEN: usize = 256;
const BINARY_LEN: usize = 29;
const INVALID_VERSION: u8 = 0xff;

/// Errors produced while parsing a trace parent.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TraceParentError {
    /// Fewer than four dash separated fields.
    #[error("expected 4 fields in trace parent, found {0}")]
    MissingFields(usize),
    /// Version is not two lowercase hex digits, or is `ff`.
    #[error("invalid trace parent version {0:?}")]
    InvalidVersion(String),
    /// Version 00 headers must have exactly four fields.
    #[error("version 00 trace parent must have exactly 4 fields, found {0}")]
    UnexpectedFields(usize),
    /// Trace id is not 32 lowercase hex digits or is all zeros.
    #[error("invalid trace id {0:?}")]
    InvalidTraceId(String),
    /// Span id is not 16 lowercase hex digits or is all zeros.
    #[error("invalid parent span id {0:?}")]
    InvalidSpanId(String),
    /// Trace options are not two hex digits.
    #[error("invalid trace options {0:?}")]
    InvalidFlags(String),
    /// Binary form has the wrong length or field markers.
    #[error("invalid binary trace parent of {0} bytes")]
    InvalidBinary(usize),
}

/// Errors produced when adding an entry to the vendor tracestate.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TraceStateError {
    /// Key or value contains a reserved or non-printable character.
    #[error("tracestate entry {0:?} contains an invalid character")]
    InvalidCharacter(String),
    /// The vendor entry would grow past its size limit.
    #[error("vendor tracestate would be {0} characters long")]
    TooLong(usize),
}

/// Read access to propagation headers of an incoming message.
pub trait Extractor {
    /// Get the value of a header, matching the name case-insensitively.
    fn get(&self, key: &str) -> Option<Cow<'_, str>>;

    /// Get every value of a repeated header.
    fn get_all(&self, key: &str) -> Option<Vec<Cow<'_, str>>> {
        self.get(key).map(|value| vec![value])
    }
}

/// Write access to propagation headers of an outgoing message.
pub trait Injector {
    /// Set a header value.
    fn set(&mut self, key: &str, value: String);
}

impl<S: std::hash::BuildHasher> Extractor for HashMap<String, String, S> {
    fn get(&self, key: &str) -> Option<Cow<'_, str>> {
        self.get(&key.to_lowercase())
            .map(|v| Cow::Borrowed(v.as_str()))
    }
}

impl<S: std::hash::BuildHasher> Injector for HashMap<String, String, S> {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_lowercase(), value);
    }
}

/// The propagated identifier set of a distributed trace.
#[derive(Clone, Debug, PartialEq)]
pub struct TraceParent {
    version: u8,
    trace_id: TraceId,
    span_id: SpanId,
    trace_options: TraceFlags,
    tracestate: Option<String>,
    vendor_entries: Vec<(String, String)>,
}

impl TraceParent {
    /// Creates a version 00 trace parent without tracestate.
    pub fn new(trace_id: TraceId, span_id: SpanId, recorded: bool) -> Self {
        TraceParent {
            version: 0,
            trace_id,
            span_id,
            trace_options: TraceFlags::NOT_RECORDED.with_recorded(recorded),
            tracestate: None,
            vendor_entries: Vec::new(),
        }
    }

    /// Parses a `traceparent` header value and an optional `tracestate`.
    pub fn parse(header: &str, tracestate: Option<&str>) -> Result<Self, TraceParentError> {
        let parts = header.trim().split('-').collect::<Vec<&str>>();
        if parts.len() < 4 {
            return Err(TraceParentError::MissingFields(parts.len()));
        }

        if !is_lower_hex(parts[0], 2) {
            return Err(TraceParentError::InvalidVersion(parts[0].to_owned()));
        }
        let version = u8::from_str_radix(parts[0], 16)
            .map_err(|_| TraceParentError::InvalidVersion(parts[0].to_owned()))?;
        if version == INVALID_VERSION {
            return Err(TraceParentError::InvalidVersion(parts[0].to_owned()));
        }
        if version == 0 && parts.len() != 4 {
            return Err(TraceParentError::UnexpectedFields(parts.len()));
        }

        let trace_id = Some(parts[1])
            .filter(|s| is_lower_hex(s, 32))
            .and_then(|s| TraceId::from_hex(s).ok())
            .filter(TraceId::is_valid)
            .ok_or_else(|| TraceParentError::InvalidTraceId(parts[1].to_owned()))?;

        let span_id = Some(parts[2])
            .filter(|s| is_lower_hex(s, 16))
            .and_then(|s| SpanId::from_hex(s).ok())
            .filter(SpanId::is_valid)
            .ok_or_else(|| TraceParentError::InvalidSpanId(parts[2].to_owned()))?;

        let flags = Some(parts[3])
            .filter(|s| is_lower_hex(s, 2))
            .and_then(|s| u8::from_str_radix(s, 16).ok())
            .ok_or_else(|| TraceParentError::InvalidFlags(parts[3].to_owned()))?;

        let tracestate = tracestate
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned);
        let vendor_entries = tracestate
            .as_deref()
            .map(parse_vendor_entries)
            .unwrap_or_default();

        Ok(TraceParent {
            version,
            trace_id,
            span_id,
            trace_options: TraceFlags::new(flags),
            tracestate,
            vendor_entries,
        })
    }

    /// Parses a header value, logging and returning `None` when malformed so
    /// the caller can start a fresh trace.
    pub fn from_string(header: &str, tracestate: Option<&str>) -> Option<Self> {
        match Self::parse(header, tracestate) {
            Ok(trace_parent) => Some(trace_parent),
            Err(err) => {
                apm_debug!(
                    name: "TraceParent.ParseFailed",
                    header = header,
                    error = err.to_string()
                );
                None
            }
        }
    }

    /// Reads the trace parent from incoming headers, preferring the standard
    /// header over the legacy one. Repeated `tracestate` headers are merged.
    pub fn from_headers(extractor: &dyn Extractor) -> Option<Self> {
        let header = extractor
            .get(TRACEPARENT_HEADER)
            .or_else(|| extractor.get(TRACEPARENT_LEGACY_HEADER))?;
        let tracestate = extractor
            .get_all(TRACESTATE_HEADER)
            .map(|values| values.join(","));
        Self::from_string(&header, tracestate.as_deref())
    }

    /// Parses the 29-byte binary form used in messaging system attributes.
    pub fn from_binary(data: &[u8]) -> Option<Self> {
        let parsed = <&[u8; BINARY_LEN]>::try_from(data)
            .ok()
            .filter(|bytes| bytes[1] == 0 && bytes[18] == 1 && bytes[27] == 2)
            .map(|bytes| {
                let mut trace_id = [0u8; 16];
                trace_id.copy_from_slice(&bytes[2..18]);
                let mut span_id = [0u8; 8];
                span_id.copy_from_slice(&bytes[19..27]);
                TraceParent {
                    version: bytes[0],
                    trace_id: TraceId::from_bytes(trace_id),
                    span_id: SpanId::from_bytes(span_id),
                    trace_options: TraceFlags::new(bytes[28]),
                    tracestate: None,
                    vendor_entries: Vec::new(),
                }
            });
        if parsed.is_none() {
            apm_debug!(
                name: "TraceParent.ParseFailed",
                error = TraceParentError::InvalidBinary(data.len()).to_string()
            );
        }
        parsed
    }

    /// Serializes to `[version, 0, trace_id, 1, span_id, 2, flags]`.
    pub fn to_binary(&self) -> [u8; BINARY_LEN] {
        let mut out = [0u8; BINARY_LEN];
        out[0] = self.version;
        out[1] = 0;
        out[2..18].copy_from_slice(&self.trace_id.to_bytes());
        out[18] = 1;
        out[19..27].copy_from_slice(&self.span_id.to_bytes());
        out[27] = 2;
        out[28] = self.trace_options.to_u8();
        out
    }

    /// Writes the propagation headers, adding the legacy header when asked.
    pub fn inject(&self, injector: &mut dyn Injector, use_legacy_header: bool) {
        let header = self.to_string();
        if use_legacy_header {
            injector.set(TRACEPARENT_LEGACY_HEADER, header.clone());
        }
        injector.set(TRACEPARENT_HEADER, header);
        if let Some(tracestate) = &self.tracestate {
            injector.set(TRACESTATE_HEADER, tracestate.clone());
        }
    }

    /// The header version.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// The trace id.
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// The parent span id.
    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    /// The trace options.
    pub fn trace_options(&self) -> TraceFlags {
        self.trace_options
    }

    /// The raw `tracestate` header value.
    pub fn tracestate(&self) -> Option<&str> {
        self.tracestate.as_deref()
    }

    /// The agent's own `key:value` entries from the tracestate, in order.
    pub fn vendor_entries(&self) -> &[(String, String)] {
        &self.vendor_entries
    }

    /// Looks up one of the agent's tracestate entries.
    pub fn tracestate_value(&self, key: &str) -> Option<&str> {
        self.vendor_entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The sample rate recorded at the root of the trace, if present and
    /// within `0.0..=1.0`.
    pub fn sample_rate(&self) -> Option<f64> {
        let raw = self.tracestate_value(SAMPLE_RATE_KEY)?;
        match raw.parse::<f64>() {
            Ok(rate) if (0.0..=1.0).contains(&rate) => Some(rate),
            _ => {
                apm_debug!(name: "TraceParent.InvalidSampleRate", value = raw);
                None
            }
        }
    }

    /// Returns a copy pointing at a different parent span.
    pub fn with_span_id(&self, span_id: SpanId) -> Self {
        TraceParent {
            span_id,
            ..self.clone()
        }
    }

    /// Returns a copy with the recorded flag set or cleared.
    pub fn with_recorded(&self, recorded: bool) -> Self {
        TraceParent {
            trace_options: self.trace_options.with_recorded(recorded),
            ..self.clone()
        }
    }

    pub(crate) fn set_span_id(&mut self, span_id: SpanId) {
        self.span_id = span_id;
    }

    /// Adds or replaces one of the agent's tracestate entries.
    ///
    /// A replaced key moves to the end. Invalid entries and entries that
    /// would make the vendor value too long are logged and ignored.
    pub fn add_tracestate(&mut self, key: &str, value: impl fmt::Display) {
        let value = value.to_string();
        if let Err(err) = self.try_add_tracestate(key, &value) {
            apm_warn!(
                name: "TraceParent.TraceStateRejected",
                key = key,
                value = value.as_str(),
                error = err.to_string()
            );
        }
    }

    /// Fallible form of [`add_tracestate`](Self::add_tracestate).
    pub fn try_add_tracestate(&mut self, key: &str, value: &str) -> Result<(), TraceStateError> {
        for part in [key, value] {
            if !is_valid_entry_part(part) {
                return Err(TraceStateError::InvalidCharacter(part.to_owned()));
            }
        }

        let mut entries = self.vendor_entries.clone();
        entries.retain(|(k, _)| k != key);
        entries.push((key.to_owned(), value.to_owned()));

        let vendor_value = entries
            .iter()
            .map(|(k, v)| format!("{k}:{v}"))
            .collect::<Vec<_>>()
            .join(";");
        if vendor_value.len() > MAX_VENDOR_VALUE_LEN {
            return Err(TraceStateError::TooLong(vendor_value.len()));
        }

        let mut members = vec![format!("{VENDOR_KEY}={vendor_value}")];
        if let Some(existing) = &self.tracestate {
            members.extend(
                existing
                    .split(',')
                    .map(str::trim)
                    .filter(|member| !member.is_empty())
                    .filter(|member| member_key(member) != VENDOR_KEY)
                    .map(str::to_owned),
            );
        }
        self.tracestate = Some(members.join(","));
        self.vendor_entries = entries;
        Ok(())
    }
}

impl fmt::Display for TraceParent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}-{}-{}-{:02x}",
            self.version, self.trace_id, self.span_id, self.trace_options
        )
    }
}

fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn is_valid_entry_part(s: &str) -> bool {
    s.chars()
        .all(|c| (' '..='~').contains(&c) && !matches!(c, ':' | ';' | ',' | '='))
}

fn member_key(member: &str) -> &str {
    member.split_once('=').map_or(member, |(k, _)| k).trim()
}

fn parse_vendor_entries(tracestate: &str) -> Vec<(String, String)> {
    tracestate
        .split(',')
        .filter_map(|member| member.trim().split_once('='))
        .filter(|(key, _)| key.trim() == VENDOR_KEY)
        .flat_map(|(_, value)| value.split(';'))
        .filter_map(|entry| entry.split_once(':'))
        .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
        .collect()
}

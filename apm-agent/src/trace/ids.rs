use serde::{Serialize, Serializer};
use std::fmt;
use std::num::ParseIntError;

/// Trace options carried in the last field of a trace parent header.
///
/// Only the lowest bit is interpreted: [`TraceFlags::RECORDED`] marks a trace
/// whose transactions are sampled. Other bits are kept as received so that a
/// header survives a parse and re-serialize unchanged.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TraceFlags(u8);

impl TraceFlags {
    /// No flags set; the trace is not recorded.
    pub const NOT_RECORDED: TraceFlags = TraceFlags(0x00);

    /// The recorded (sampled) flag.
    pub const RECORDED: TraceFlags = TraceFlags(0x01);

    /// Construct flags from their raw byte.
    pub const fn new(flags: u8) -> Self {
        TraceFlags(flags)
    }

    /// Returns `true` if the recorded flag is set.
    pub fn is_recorded(&self) -> bool {
        self.0 & Self::RECORDED.0 == Self::RECORDED.0
    }

    /// Returns a copy with the recorded flag set or cleared, other bits kept.
    pub fn with_recorded(&self, recorded: bool) -> Self {
        if recorded {
            TraceFlags(self.0 | Self::RECORDED.0)
        } else {
            TraceFlags(self.0 & !Self::RECORDED.0)
        }
    }

    /// Returns the raw flags byte.
    pub fn to_u8(self) -> u8 {
        self.0
    }
}

impl fmt::LowerHex for TraceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// A 16-byte trace identifier shared by every event of one trace.
///
/// The id is valid if it contains at least one non-zero byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId(u128);

impl TraceId {
    /// Invalid trace id
    pub const INVALID: TraceId = TraceId(0);

    /// Create a trace id from its big-endian byte representation.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        TraceId(u128::from_be_bytes(bytes))
    }

    /// Return the big-endian byte representation of this trace id.
    pub const fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    /// Converts a string in base 16 to a trace id.
    ///
    /// ```
    /// use apm_agent::trace::TraceId;
    ///
    /// assert!(TraceId::from_hex("0af7651916cd43dd8448eb211c80319c").is_ok());
    /// assert!(TraceId::from_hex("not_hex").is_err());
    /// ```
    pub fn from_hex(hex: &str) -> Result<Self, ParseIntError> {
        u128::from_str_radix(hex, 16).map(TraceId)
    }

    /// Returns `false` for the all-zero id.
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl From<u128> for TraceId {
    fn from(value: u128) -> Self {
        TraceId(value)
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl Serialize for TraceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// An 8-byte identifier of a transaction or span.
///
/// The id is valid if it contains at least one non-zero byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId(u64);

impl SpanId {
    /// Invalid span id
    pub const INVALID: SpanId = SpanId(0);

    /// Create a span id from its big-endian byte representation.
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        SpanId(u64::from_be_bytes(bytes))
    }

    /// Return the big-endian byte representation of this span id.
    pub const fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Converts a string in base 16 to a span id.
    ///
    /// ```
    /// use apm_agent::trace::SpanId;
    ///
    /// assert!(SpanId::from_hex("b7ad6b7169203331").is_ok());
    /// assert!(SpanId::from_hex("not_hex").is_err());
    /// ```
    pub fn from_hex(hex: &str) -> Result<Self, ParseIntError> {
        u64::from_str_radix(hex, 16).map(SpanId)
    }

    /// Returns `false` for the all-zero id.
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl From<u64> for SpanId {
    fn from(value: u64) -> Self {
        SpanId(value)
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl Serialize for SpanId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[rustfmt::skip]
    fn trace_id_test_data() -> Vec<(TraceId, &'static str, [u8; 16])> {
        vec![
            (TraceId(0), "00000000000000000000000000000000", [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
            (TraceId(42), "0000000000000000000000000000002a", [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 42]),
            (TraceId(126642714606581564793456114182061442190), "5f467fe7bf42676c05e20ba4a90e448e", [95, 70, 127, 231, 191, 66, 103, 108, 5, 226, 11, 164, 169, 14, 68, 142])
        ]
    }

    #[rustfmt::skip]
    fn span_id_test_data() -> Vec<(SpanId, &'static str, [u8; 8])> {
        vec![
            (SpanId(0), "0000000000000000", [0, 0, 0, 0, 0, 0, 0, 0]),
            (SpanId(42), "000000000000002a", [0, 0, 0, 0, 0, 0, 0, 42]),
            (SpanId(5508496025762705295), "4c721bf33e3caf8f", [76, 114, 27, 243, 62, 60, 175, 143])
        ]
    }

    #[test]
    fn test_trace_id() {
        for (id, hex, bytes) in trace_id_test_data() {
            assert_eq!(id.to_string(), hex);
            assert_eq!(id.to_bytes(), bytes);
            assert_eq!(id, TraceId::from_hex(hex).unwrap());
            assert_eq!(id, TraceId::from_bytes(bytes));
        }
    }

    #[test]
    fn test_span_id() {
        for (id, hex, bytes) in span_id_test_data() {
            assert_eq!(id.to_string(), hex);
            assert_eq!(id.to_bytes(), bytes);
            assert_eq!(id, SpanId::from_hex(hex).unwrap());
            assert_eq!(id, SpanId::from_bytes(bytes));
        }
    }

    #[test]
    fn ids_serialize_as_hex_strings() {
        assert_eq!(
            serde_json::to_string(&SpanId::from(42)).unwrap(),
            "\"000000000000002a\""
        );
        assert_eq!(
            serde_json::to_string(&TraceId::from(42)).unwrap(),
            "\"0000000000000000000000000000002a\""
        );
    }

    #[test]
    fn recorded_flag_keeps_other_bits() {
        let flags = TraceFlags::new(0x08);
        assert!(!flags.is_recorded());
        let recorded = flags.with_recorded(true);
        assert!(recorded.is_recorded());
        assert_eq!(recorded.to_u8(), 0x09);
        assert_eq!(recorded.with_recorded(false).to_u8(), 0x08);
    }
}

//! Merging runs of similar exit spans into composite spans.
//!
//! Every transaction and every recording span owns one [`CompressionBuffer`]
//! holding at most one finished child. When the next child ends it is
//! either merged into the buffered one, or the buffered one is flushed and
//! the new child takes its place. When the parent ends its buffer is closed
//! and whatever it holds is flushed.
use crate::export::{millis, CompositeRecord, SpanRecord};
use crate::trace::{lock, Outcome};
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;

/// How the spans of a composite were matched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionStrategy {
    /// Same name, type, subtype, action and destination.
    ExactMatch,
    /// Same type, subtype and destination.
    SameKind,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct CompressionSettings {
    pub(crate) enabled: bool,
    pub(crate) exact_match_max_duration: Duration,
    pub(crate) same_kind_max_duration: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Composite {
    pub(crate) strategy: CompressionStrategy,
    pub(crate) count: usize,
    pub(crate) sum: Duration,
}

/// A span that has ended but may not have been reported yet.
#[derive(Clone, Debug)]
pub(crate) struct FinishedSpan {
    /// Everything but `duration` and `composite`, which are filled in by
    /// [`FinishedSpan::into_record`].
    pub(crate) record: SpanRecord,
    pub(crate) start_offset: Duration,
    pub(crate) duration: Duration,
    pub(crate) leaf: bool,
    pub(crate) propagated: bool,
    pub(crate) resource: Option<String>,
    pub(crate) composite: Option<Composite>,
}

impl FinishedSpan {
    fn is_compression_eligible(&self) -> bool {
        self.leaf
            && !self.propagated
            && self.record.outcome == Outcome::Success
            && self.resource.is_some()
    }

    /// Exit spans that nobody downstream can refer to.
    pub(crate) fn is_discardable(&self) -> bool {
        self.leaf && !self.propagated && self.record.outcome == Outcome::Success
    }

    /// Number of spans this one stands for.
    pub(crate) fn count(&self) -> usize {
        self.composite.as_ref().map_or(1, |composite| composite.count)
    }

    fn is_same_kind(&self, other: &FinishedSpan) -> bool {
        self.record.span_type == other.record.span_type
            && self.record.subtype == other.record.subtype
            && self.resource.is_some()
            && self.resource == other.resource
    }

    fn is_exact_match(&self, other: &FinishedSpan) -> bool {
        self.is_same_kind(other)
            && self.record.name == other.record.name
            && self.record.action == other.record.action
    }

    fn matching_strategy(
        &self,
        sibling: &FinishedSpan,
        settings: &CompressionSettings,
    ) -> Option<CompressionStrategy> {
        let exact_max = settings.exact_match_max_duration;
        let same_kind_max = settings.same_kind_max_duration;
        match &self.composite {
            None => {
                if self.is_exact_match(sibling)
                    && self.duration <= exact_max
                    && sibling.duration <= exact_max
                {
                    Some(CompressionStrategy::ExactMatch)
                } else if self.is_same_kind(sibling)
                    && self.duration <= same_kind_max
                    && sibling.duration <= same_kind_max
                {
                    Some(CompressionStrategy::SameKind)
                } else {
                    None
                }
            }
            Some(composite) => {
                // A same_kind composite has been renamed, so only the
                // same_kind test applies to it.
                if composite.strategy == CompressionStrategy::ExactMatch
                    && self.is_exact_match(sibling)
                    && sibling.duration <= exact_max
                {
                    Some(CompressionStrategy::ExactMatch)
                } else if self.is_same_kind(sibling) && sibling.duration <= same_kind_max {
                    Some(CompressionStrategy::SameKind)
                } else {
                    None
                }
            }
        }
    }

    /// Merges `sibling` into this span if they match. Returns whether they
    /// were merged.
    fn try_merge(&mut self, sibling: &FinishedSpan, settings: &CompressionSettings) -> bool {
        let Some(strategy) = self.matching_strategy(sibling, settings) else {
            return false;
        };
        let first_duration = self.duration;
        let composite = self.composite.get_or_insert(Composite {
            strategy,
            count: 1,
            sum: first_duration,
        });
        composite.strategy = strategy;
        composite.count += 1;
        composite.sum += sibling.duration;
        if strategy == CompressionStrategy::SameKind {
            if let Some(resource) = &self.resource {
                self.record.name = format!("Calls to {resource}");
            }
        }
        let sibling_end = sibling.start_offset + sibling.duration;
        self.duration = self
            .duration
            .max(sibling_end.saturating_sub(self.start_offset));
        true
    }

    pub(crate) fn into_record(self) -> SpanRecord {
        let mut record = self.record;
        record.duration = millis(self.duration);
        record.composite = self
            .composite
            .filter(|composite| composite.count >= 2)
            .map(|composite| CompositeRecord {
                compression_strategy: composite.strategy,
                count: composite.count,
                sum: millis(composite.sum),
            });
        record
    }
}

#[derive(Debug, Default)]
struct BufferState {
    slot: Option<FinishedSpan>,
    closed: bool,
}

/// Single-slot buffer of a parent's most recently ended child.
#[derive(Debug, Default)]
pub(crate) struct CompressionBuffer {
    state: Mutex<BufferState>,
}

impl CompressionBuffer {
    /// Offers an ended child to the buffer. Returns the spans to report now,
    /// in order.
    pub(crate) fn on_child_end(
        &self,
        child: FinishedSpan,
        settings: &CompressionSettings,
    ) -> Vec<FinishedSpan> {
        let mut state = lock(&self.state);
        if state.closed {
            return vec![child];
        }
        if !settings.enabled || !child.is_compression_eligible() {
            let mut ready: Vec<FinishedSpan> = state.slot.take().into_iter().collect();
            ready.push(child);
            return ready;
        }
        if let Some(buffered) = state.slot.as_mut() {
            if buffered.try_merge(&child, settings) {
                return Vec::new();
            }
        }
        state.slot.replace(child).into_iter().collect()
    }

    /// Closes the buffer, returning the span it held. Children ending later
    /// are reported directly.
    pub(crate) fn close(&self) -> Option<FinishedSpan> {
        let mut state = lock(&self.state);
        state.closed = true;
        state.slot.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{SpanId, TraceId};
    use rstest::rstest;

    fn settings() -> CompressionSettings {
        CompressionSettings {
            enabled: true,
            exact_match_max_duration: Duration::from_millis(50),
            same_kind_max_duration: Duration::from_millis(5),
        }
    }

    fn finished(name: &str, start_ms: u64, duration_ms: u64) -> FinishedSpan {
        FinishedSpan {
            record: SpanRecord {
                id: SpanId::from(start_ms + 10),
                transaction_id: SpanId::from(1),
                parent_id: SpanId::from(1),
                trace_id: TraceId::from(1),
                name: name.to_string(),
                span_type: "db".into(),
                subtype: Some("redis".into()),
                action: Some("query".into()),
                start: start_ms as f64,
                timestamp: 0,
                duration: 0.0,
                outcome: Outcome::Success,
                sync: None,
                sample_rate: None,
                context: None,
                stacktrace: Vec::new(),
                composite: None,
                links: Vec::new(),
            },
            start_offset: Duration::from_millis(start_ms),
            duration: Duration::from_millis(duration_ms),
            leaf: true,
            propagated: false,
            resource: Some("redis".into()),
            composite: None,
        }
    }

    #[test]
    fn exact_matches_merge_into_one_composite() {
        let buffer = CompressionBuffer::default();
        for i in 0..3 {
            assert!(buffer
                .on_child_end(finished("GET", i * 10, 2 + i), &settings())
                .is_empty());
        }
        let composite = buffer.close().unwrap();
        assert_eq!(composite.count(), 3);
        assert_eq!(composite.duration, Duration::from_millis(24));
        let record = composite.into_record();
        let metadata = record.composite.unwrap();
        assert_eq!(metadata.compression_strategy, CompressionStrategy::ExactMatch);
        assert_eq!(metadata.count, 3);
        assert_eq!(metadata.sum, 9.0);
        assert_eq!(record.name, "GET");
    }

    #[test]
    fn same_kind_renames_and_never_narrows() {
        let buffer = CompressionBuffer::default();
        assert!(buffer.on_child_end(finished("GET", 0, 1), &settings()).is_empty());
        assert!(buffer.on_child_end(finished("SET", 2, 1), &settings()).is_empty());
        assert!(buffer.on_child_end(finished("SET", 4, 1), &settings()).is_empty());
        let record = buffer.close().unwrap().into_record();
        assert_eq!(record.name, "Calls to redis");
        let metadata = record.composite.unwrap();
        assert_eq!(metadata.compression_strategy, CompressionStrategy::SameKind);
        assert_eq!(metadata.count, 3);
    }

    #[test]
    fn exact_composite_widens_to_same_kind() {
        let buffer = CompressionBuffer::default();
        assert!(buffer.on_child_end(finished("GET", 0, 1), &settings()).is_empty());
        assert!(buffer.on_child_end(finished("GET", 2, 1), &settings()).is_empty());
        assert!(buffer.on_child_end(finished("SET", 4, 1), &settings()).is_empty());
        let record = buffer.close().unwrap().into_record();
        assert_eq!(
            record.composite.unwrap().compression_strategy,
            CompressionStrategy::SameKind
        );
    }

    #[test]
    fn non_matching_sibling_flushes_buffered_span() {
        let buffer = CompressionBuffer::default();
        assert!(buffer.on_child_end(finished("GET", 0, 1), &settings()).is_empty());
        let flushed = buffer.on_child_end(finished("SET", 2, 30), &settings());
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].record.name, "GET");
        assert!(flushed[0].clone().into_record().composite.is_none());
        assert_eq!(buffer.close().unwrap().record.name, "SET");
    }

    #[rstest]
    #[case::not_leaf(|span: &mut FinishedSpan| span.leaf = false)]
    #[case::failed(|span: &mut FinishedSpan| span.record.outcome = Outcome::Failure)]
    #[case::unknown(|span: &mut FinishedSpan| span.record.outcome = Outcome::Unknown)]
    #[case::propagated(|span: &mut FinishedSpan| span.propagated = true)]
    #[case::no_resource(|span: &mut FinishedSpan| span.resource = None)]
    fn ineligible_span_flushes_and_passes_through(#[case] change: fn(&mut FinishedSpan)) {
        let buffer = CompressionBuffer::default();
        assert!(buffer.on_child_end(finished("GET", 0, 1), &settings()).is_empty());
        let mut ineligible = finished("GET", 2, 1);
        change(&mut ineligible);
        let ready = buffer.on_child_end(ineligible, &settings());
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].start_offset, Duration::ZERO);
        assert_eq!(ready[1].start_offset, Duration::from_millis(2));
        assert!(buffer.close().is_none());
    }

    #[test]
    fn disabled_compression_passes_everything_through() {
        let disabled = CompressionSettings {
            enabled: false,
            ..settings()
        };
        let buffer = CompressionBuffer::default();
        assert_eq!(buffer.on_child_end(finished("GET", 0, 1), &disabled).len(), 1);
        assert_eq!(buffer.on_child_end(finished("GET", 2, 1), &disabled).len(), 1);
    }

    #[test]
    fn closed_buffer_reports_directly() {
        let buffer = CompressionBuffer::default();
        assert!(buffer.close().is_none());
        assert_eq!(buffer.on_child_end(finished("GET", 0, 1), &settings()).len(), 1);
    }

    #[test]
    fn too_long_for_exact_match() {
        let buffer = CompressionBuffer::default();
        assert!(buffer.on_child_end(finished("GET", 0, 60), &settings()).is_empty());
        let flushed = buffer.on_child_end(finished("GET", 70, 1), &settings());
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].count(), 1);
    }
}

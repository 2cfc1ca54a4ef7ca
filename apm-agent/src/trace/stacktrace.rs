use serde::Serialize;
use std::backtrace::Backtrace;
use std::fmt;

const AGENT_FRAME_PREFIXES: &[&str] = &["apm_agent::", "std::backtrace", "<apm_agent::"];
const LIBRARY_FRAME_PREFIXES: &[&str] = &[
    "std::",
    "core::",
    "alloc::",
    "<std::",
    "<core::",
    "<alloc::",
    "tokio::",
    "futures_",
    "__rust",
    "__libc",
    "_start",
];

/// One frame of a captured call stack.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Frame {
    /// Demangled function path.
    pub function: String,
    /// File name without directories.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Path as recorded in debug info.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abs_path: Option<String>,
    /// Line number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lineno: Option<u32>,
    /// Whether the frame belongs to the standard library or a runtime.
    pub library_frame: bool,
}

/// Produces the frames of the current call site.
///
/// Collectors are called on the thread that ends a span or captures an
/// error, after the agent decided the frames are wanted.
pub trait FramesCollector: Send + Sync + fmt::Debug {
    /// Collect at most `limit` frames, innermost first.
    fn collect(&self, limit: usize) -> Vec<Frame>;
}

/// Default collector built on [`std::backtrace::Backtrace`].
///
/// Frames of the agent itself are skipped. Frames are read from the
/// backtrace's `Display` text, whose format std does not promise to keep.
/// Lines that do not look like a frame or a location are ignored, so an
/// unexpected format, a platform without backtrace support or a binary
/// without debug info yields fewer frames, frames without locations, or
/// none at all. Collection never fails.
#[derive(Clone, Debug, Default)]
pub struct BacktraceCollector {
    _private: (),
}

impl FramesCollector for BacktraceCollector {
    fn collect(&self, limit: usize) -> Vec<Frame> {
        if limit == 0 {
            return Vec::new();
        }
        parse_backtrace(&Backtrace::force_capture().to_string(), limit)
    }
}

/// Collector that never returns frames.
#[derive(Clone, Debug, Default)]
pub struct NoopFramesCollector {
    _private: (),
}

impl FramesCollector for NoopFramesCollector {
    fn collect(&self, _limit: usize) -> Vec<Frame> {
        Vec::new()
    }
}

/// Parses the `Display` output of a backtrace:
///
/// ```text
///    0: my_app::handler
///              at ./src/handler.rs:42:9
/// ```
pub(crate) fn parse_backtrace(rendered: &str, limit: usize) -> Vec<Frame> {
    let mut frames: Vec<Frame> = Vec::new();
    let mut skipping = false;
    for line in rendered.lines() {
        let line = line.trim_start();
        if let Some(location) = line.strip_prefix("at ") {
            if skipping {
                continue;
            }
            if let Some(frame) = frames.last_mut() {
                apply_location(frame, location);
            }
            continue;
        }
        let Some((index, function)) = line.split_once(": ") else {
            continue;
        };
        if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let function = function.trim();
        skipping = AGENT_FRAME_PREFIXES
            .iter()
            .any(|prefix| function.starts_with(prefix));
        if skipping {
            continue;
        }
        if frames.len() == limit {
            break;
        }
        frames.push(Frame {
            function: function.to_owned(),
            filename: None,
            abs_path: None,
            lineno: None,
            library_frame: LIBRARY_FRAME_PREFIXES
                .iter()
                .any(|prefix| function.starts_with(prefix)),
        });
    }
    frames
}

fn apply_location(frame: &mut Frame, location: &str) {
    let mut parts = location.rsplitn(3, ':');
    let (column, line, path) = (parts.next(), parts.next(), parts.next());
    let (path, lineno) = match (path, line, column) {
        (Some(path), Some(line), Some(_)) => (path, line.parse().ok()),
        _ => (location, None),
    };
    frame.filename = path
        .rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty())
        .map(str::to_owned);
    frame.abs_path = Some(path.to_owned());
    frame.lineno = lineno;
    if path.contains("/rustc/") || path.contains(".cargo/registry") {
        frame.library_frame = true;
    }
}

/// The first frame that belongs to application code, used as an error's
/// culprit.
pub(crate) fn culprit(frames: &[Frame]) -> Option<String> {
    frames
        .iter()
        .find(|frame| !frame.library_frame)
        .map(|frame| frame.function.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const RENDERED: &str = "   0: std::backtrace::Backtrace::force_capture
             at /rustc/abc/library/std/src/backtrace.rs:312:13
   1: apm_agent::trace::span::Span::end
             at ./apm-agent/src/trace/span.rs:200:9
   2: my_app::db::query
             at ./src/db.rs:42:9
   3: my_app::main
             at ./src/main.rs:7:5
   4: core::ops::function::FnOnce::call_once
             at /rustc/abc/library/core/src/ops/function.rs:250:5
   5: main
";

    #[test]
    fn parses_frames_and_skips_agent_frames() {
        let frames = parse_backtrace(RENDERED, 10);
        let functions: Vec<_> = frames.iter().map(|f| f.function.as_str()).collect();
        assert_eq!(
            functions,
            vec![
                "my_app::db::query",
                "my_app::main",
                "core::ops::function::FnOnce::call_once",
                "main"
            ]
        );
        assert_eq!(frames[0].filename.as_deref(), Some("db.rs"));
        assert_eq!(frames[0].abs_path.as_deref(), Some("./src/db.rs"));
        assert_eq!(frames[0].lineno, Some(42));
        assert!(!frames[0].library_frame);
        assert!(frames[2].library_frame);
        assert_eq!(frames[3].lineno, None);
    }

    #[test]
    fn respects_limit() {
        assert_eq!(parse_backtrace(RENDERED, 1).len(), 1);
        assert!(BacktraceCollector::default().collect(0).is_empty());
    }

    #[rstest]
    #[case::unsupported("unsupported backtrace")]
    #[case::disabled("disabled backtrace")]
    #[case::empty("")]
    #[case::location_before_any_frame("             at ./src/db.rs:42:9\n")]
    fn unrecognized_output_yields_no_frames(#[case] rendered: &str) {
        assert!(parse_backtrace(rendered, 10).is_empty());
    }

    #[test]
    fn frames_without_debug_info_keep_only_functions() {
        let rendered = "   0: my_app::db::query
   1: <unknown>
      [... omitted 3 frames ...]
   2: my_app::main
             at src/main.rs
";
        let frames = parse_backtrace(rendered, 10);
        let functions: Vec<_> = frames.iter().map(|f| f.function.as_str()).collect();
        assert_eq!(functions, vec!["my_app::db::query", "<unknown>", "my_app::main"]);
        assert!(frames[..2].iter().all(|frame| frame.abs_path.is_none()));
        assert_eq!(frames[2].filename.as_deref(), Some("main.rs"));
        assert_eq!(frames[2].lineno, None);
    }

    #[test]
    fn live_capture_stays_within_limit() {
        let frames = BacktraceCollector::default().collect(3);
        assert!(frames.len() <= 3);
        assert!(frames
            .iter()
            .all(|frame| !frame.function.starts_with("apm_agent::")));
    }

    #[test]
    fn culprit_is_first_application_frame() {
        let mut frames = parse_backtrace(RENDERED, 10);
        frames.rotate_left(2);
        assert_eq!(culprit(&frames).as_deref(), Some("main"));
        assert_eq!(culprit(&[]), None);
    }
}

#![allow(unused_macros)]
//! Diagnostics the agent emits about itself.
//!
//! These macros (`apm_info!`, `apm_warn!`, `apm_debug!` and `apm_error!`)
//! are meant for the agent's own code and for custom queues, exporters and
//! processors. They are not an application logging facility.
//!
//! Every event carries a `name` such as `"BatchEventQueue.ExportFailed"`
//! followed by optional `key = value` attributes. Attribute values must
//! implement `Display`.
//!
//! When running tests with `--nocapture` the events are also printed to
//! stdout.

/// Emits an informational agent event.
///
/// ```rust
/// use apm_agent::apm_info;
/// apm_info!(name: "Tracer.Built", sample_rate = 1.0);
/// ```
#[macro_export]
macro_rules! apm_info {
    (name: $name:expr $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::info!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name);
        }

        #[cfg(test)]
        {
            print!("apm_info: name={}\n", $name);
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = $name;
        }
    };
    (name: $name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::info!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name, $($key = $value),+);
        }

        #[cfg(test)]
        {
            print!("apm_info: name={}", $name);
            $(
                print!(", {}={}", stringify!($key), $value);
            )+
            print!("\n");
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = ($name, $($value),+);
        }
    };
}

/// Emits a warning about a recoverable agent fault.
///
/// ```rust
/// use apm_agent::apm_warn;
/// apm_warn!(name: "Config.InvalidValue", key = "APM_AGENT_TRANSACTION_MAX_SPANS", value = "lots");
/// ```
#[macro_export]
macro_rules! apm_warn {
    (name: $name:expr $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::warn!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name);
        }

        #[cfg(test)]
        {
            print!("apm_warn: name={}\n", $name);
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = $name;
        }
    };
    (name: $name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::warn!(name: $name,
                            target: env!("CARGO_PKG_NAME"),
                            name = $name,
                            $($key = {
                                    $value
                            }),+,
                    )
        }

        #[cfg(test)]
        {
            print!("apm_warn: name={}", $name);
            $(
                print!(", {}={}", stringify!($key), $value);
            )+
            print!("\n");
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = ($name, $($value),+);
        }
    };
}

/// Emits a debug event, typically for decisions made on the hot path.
///
/// ```rust
/// use apm_agent::apm_debug;
/// apm_debug!(name: "Transaction.SpanDiscarded", reason = "exit_span_min_duration");
/// ```
#[macro_export]
macro_rules! apm_debug {
    (name: $name:expr $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::debug!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name);
        }

        #[cfg(test)]
        {
            print!("apm_debug: name={}\n", $name);
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = $name;
        }
    };
    (name: $name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::debug!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name, $($key = $value),+);
        }

        #[cfg(test)]
        {
            print!("apm_debug: name={}", $name);
            $(
                print!(", {}={}", stringify!($key), $value);
            )+
            print!("\n");
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = ($name, $($value),+);
        }
    };
}

/// Emits an error event. Reserved for faults that lose telemetry.
///
/// ```rust
/// use apm_agent::apm_error;
/// apm_error!(name: "BatchEventQueue.ThreadSpawnFailed", error = "out of threads");
/// ```
#[macro_export]
macro_rules! apm_error {
    (name: $name:expr $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::error!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name);
        }

        #[cfg(test)]
        {
            print!("apm_error: name={}\n", $name);
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = $name;
        }
    };
    (name: $name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::error!(name: $name,
                            target: env!("CARGO_PKG_NAME"),
                            name = $name,
                            $($key = {
                                    $value
                            }),+,
                    )
        }

        #[cfg(test)]
        {
            print!("apm_error: name={}", $name);
            $(
                print!(", {}={}", stringify!($key), $value);
            )+
            print!("\n");
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = ($name, $($value),+);
        }
    };
}

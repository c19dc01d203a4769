//! Tracing setup for processes that have not installed a subscriber.
//!
//! The library only ever emits `tracing` events; it never requires this
//! module. It exists so that small tools and the test suites can see the
//! dispatcher's request/response records and the workers' stderr without
//! wiring up `tracing-subscriber` themselves.
//!
//! The filter is resolved from the environment: `BATONIO_LOG` first, then
//! `RUST_LOG`, then the default level given to [`init`]. Setting
//! `BATONIO_LOG_JSON` to anything but `0` switches output to JSON
//! records.

use std::env;
use std::io;

pub use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;

/// Variables consulted for a filter spec, most specific first.
const FILTER_VARS: [&str; 2] = ["BATONIO_LOG", "RUST_LOG"];

/// Variable that switches output to JSON records.
const JSON_VAR: &str = "BATONIO_LOG_JSON";

/// Install a global subscriber writing to stderr, honouring the
/// environment as described in the module documentation.
///
/// `default_level` applies when no filter variable is set. Returns true
/// if this call installed the subscriber, or false if one was already in
/// place (so callers sharing a process may all call this safely).
pub fn init(default_level: Level) -> bool {
    let json = env::var(JSON_VAR).is_ok_and(|v| is_truthy(&v));
    init_with(default_level, json)
}

/// As [`init`], but choosing JSON records explicitly rather than reading
/// `BATONIO_LOG_JSON`.
pub fn init_with(default_level: Level, json: bool) -> bool {
    let builder = fmt()
        .with_env_filter(filter_from_env(default_level))
        .with_writer(io::stderr);

    if json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    }
}

/// The first parseable filter spec from the environment, or a filter
/// admitting everything at `default_level` and above.
fn filter_from_env(default_level: Level) -> EnvFilter {
    for var in FILTER_VARS {
        let Ok(spec) = env::var(var) else { continue };

        match spec.parse::<EnvFilter>() {
            Ok(filter) => return filter,
            Err(e) => eprintln!("ignoring bad filter {var}={spec}: {e}"),
        }
    }

    EnvFilter::default().add_directive(LevelFilter::from_level(default_level).into())
}

fn is_truthy(value: &str) -> bool {
    !value.is_empty() && value != "0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_truthy() {
        assert!(is_truthy("1"));
        assert!(is_truthy("true"));
        assert!(!is_truthy("0"));
        assert!(!is_truthy(""));
    }

    #[test]
    fn test_init_installs_once() {
        assert!(init_with(Level::WARN, false));

        // The process already has a subscriber now, so further calls
        // report that they did nothing.
        assert!(!init_with(Level::DEBUG, true));
        assert!(!init(Level::INFO));
    }
}

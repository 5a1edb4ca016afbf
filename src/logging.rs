//! Log output control
//!
//! The proxy logs through `tracing`. [`init`] installs a subscriber with a
//! reloadable level filter; the starting level honors the `ECHO_LOG`
//! environment variable, and [`set_enabled`] flips output on or off at
//! runtime. Embedding programs that install their own subscriber can skip
//! [`init`] entirely; the proxy then emits into whatever is registered.

use std::env;
use std::sync::OnceLock;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, Registry};

static RELOAD_HANDLE: OnceLock<reload::Handle<LevelFilter, Registry>> = OnceLock::new();

/// Values of `ECHO_LOG` that silence output at startup.
const OFF_VALUES: [&str; 4] = ["0", "false", "no", "off"];

/// Whether `ECHO_LOG` asks for log output to be discarded.
fn disabled_by_env() -> bool {
    match env::var("ECHO_LOG") {
        Ok(v) => OFF_VALUES.contains(&v.trim().to_ascii_lowercase().as_str()),
        Err(_) => false,
    }
}

/// Install the proxy's tracing subscriber.
///
/// Idempotent; does nothing if a global subscriber is already registered.
pub fn init() {
    let level = if disabled_by_env() {
        LevelFilter::OFF
    } else {
        LevelFilter::INFO
    };

    let (filter, handle) = reload::Layer::new(level);
    if tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .is_ok()
    {
        let _ = RELOAD_HANDLE.set(handle);
    }
}

/// Enable or silence log output at runtime.
///
/// Only affects the subscriber installed by [`init`].
pub fn set_enabled(enabled: bool) {
    if let Some(handle) = RELOAD_HANDLE.get() {
        let level = if enabled {
            LevelFilter::INFO
        } else {
            LevelFilter::OFF
        };
        let _ = handle.modify(|filter| *filter = level);
    }
}

//! Logging bootstrap.
//!
//! Every component logs through the `log` facade at levels matching
//! severity (`trace`/`debug` for per-message forwarding decisions, `info`
//! for lifecycle events, `warn` for degraded conditions, `error` for
//! persistence/crypto failures). This module only owns turning that
//! facade on, driven by `RUST_LOG` or an explicit verbosity string from
//! the CLI.

/// Install `env_logger` as the global logger. `default_level` is used when
/// `RUST_LOG` is unset; an explicit `RUST_LOG` always wins.
pub fn init(default_level: &str) {
    let env = env_logger::Env::default().default_filter_or(default_level.to_string());
    let _ = env_logger::Builder::from_env(env).try_init();
}

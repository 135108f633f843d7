//! tracing setup for the daemon and `llamaprox-ctl`.
//!
//! A bare level such as `debug` applies to llamaprox's own targets only;
//! hyper, reqwest, tungstenite and friends stay at `warn`. Anything with a
//! `=` or `,` is taken as a full `EnvFilter` directive string. Events go to
//! stderr with time since startup, so stdout stays free for the startup
//! summary and ctl replies.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::uptime;

use crate::error::AppError;

/// Targets a bare level applies to.
const OWN_TARGETS: &[&str] = &["llamaprox", "llamaprox_ctl"];

/// Level for every other target when a bare level is given.
const DEPENDENCY_LEVEL: &str = "warn";

/// Turn a configured level into filter directives.
pub fn directives(level: &str) -> Result<String, AppError> {
    let level = level.trim();
    if level.contains(['=', ',']) {
        return Ok(level.to_string());
    }
    parse_level(level)?;
    let level = level.to_ascii_lowercase();
    let mut out = DEPENDENCY_LEVEL.to_string();
    for target in OWN_TARGETS {
        out.push_str(&format!(",{target}={level}"));
    }
    Ok(out)
}

/// Install the global subscriber.
///
/// With `prefer_level` (a `-v` flag was given) `level` wins over `RUST_LOG`;
/// otherwise `RUST_LOG` wins and `level` is the fallback.
pub fn init(level: &str, prefer_level: bool) -> Result<(), AppError> {
    let from_level = || {
        directives(level).and_then(|d| {
            EnvFilter::try_new(&d)
                .map_err(|e| AppError::Logger(format!("invalid log filter '{d}': {e}")))
        })
    };
    let filter = if prefer_level {
        from_level()?
    } else {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => from_level()?,
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_timer(uptime())
        .compact()
        .try_init()
        .map_err(|e| AppError::Logger(format!("failed to set subscriber: {e}")))
}

/// Reject empty or unknown level names.
pub fn parse_level(level: &str) -> Result<LevelFilter, AppError> {
    if level.is_empty() {
        return Err(AppError::Logger("log level must not be empty".into()));
    }
    level
        .parse::<LevelFilter>()
        .map_err(|_| AppError::Logger(format!("unrecognised log level: '{level}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_level_scopes_to_own_targets() {
        assert_eq!(
            directives("debug").unwrap(),
            "warn,llamaprox=debug,llamaprox_ctl=debug"
        );
        assert_eq!(
            directives(" TRACE ").unwrap(),
            "warn,llamaprox=trace,llamaprox_ctl=trace"
        );
    }

    #[test]
    fn full_filters_pass_through() {
        assert_eq!(
            directives("info,tower_http=debug").unwrap(),
            "info,tower_http=debug"
        );
        assert_eq!(directives("llamaprox::subsystems::llama=trace").unwrap(),
            "llamaprox::subsystems::llama=trace");
    }

    #[test]
    fn unknown_levels_rejected() {
        assert!(parse_level("loud").is_err());
        assert!(parse_level("").is_err());
        assert!(matches!(directives("chatty"), Err(AppError::Logger(_))));
    }

    #[test]
    fn second_init_reports_logger_error() {
        // Another test may have installed the subscriber first.
        let _ = init("info", false);
        match init("debug", true) {
            Err(AppError::Logger(msg)) => assert!(msg.contains("set subscriber")),
            other => panic!("expected logger error, got {other:?}"),
        }
    }
}

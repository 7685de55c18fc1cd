use crate::config::AppConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Target of the per-mutation events emitted by `TracingInterceptor`
pub const LEDGER_TRACE_TARGET: &str = "LEDGER_TRACE";

/// Filter directive for the configured level; `RUST_LOG` wins when set
fn filter_directive(config: &AppConfig) -> String {
    if config.enable_tracing {
        config.log_level.clone()
    } else {
        format!("{},{}=off", config.log_level, LEDGER_TRACE_TARGET)
    }
}

/// Install the global subscriber. Keep the guard alive until exit or
/// buffered file output is lost.
pub fn init_logging(config: &AppConfig) -> WorkerGuard {
    let file_appender = match config.rotation.as_str() {
        "hourly" => tracing_appender::rolling::hourly(&config.log_dir, &config.log_file),
        "daily" => tracing_appender::rolling::daily(&config.log_dir, &config.log_file),
        _ => tracing_appender::rolling::never(&config.log_dir, &config.log_file),
    };

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(config)));

    let registry = tracing_subscriber::registry().with(filter);

    if config.use_json {
        let file_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_writer(non_blocking)
            .with_ansi(false);
        registry.with(file_layer).init();
    } else {
        // Target kept so LEDGER_TRACE lines stand out
        let file_layer = fmt::layer()
            .with_target(true)
            .with_writer(non_blocking)
            .with_ansi(false);
        let stdout_layer = fmt::layer().with_target(false).with_ansi(true);
        registry.with(file_layer).with(stdout_layer).init();
    }

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(enable_tracing: bool) -> AppConfig {
        AppConfig::from_yaml_str(&format!(
            "log_level: debug\nlog_dir: ./logs\nlog_file: l.log\nuse_json: false\nrotation: never\nenable_tracing: {}\n",
            enable_tracing
        ))
        .unwrap()
    }

    #[test]
    fn test_trace_target_silenced_by_default() {
        assert_eq!(filter_directive(&config(false)), "debug,LEDGER_TRACE=off");
        assert_eq!(filter_directive(&config(true)), "debug");
    }
}

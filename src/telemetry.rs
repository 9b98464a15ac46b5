//! Tracing setup: env-filtered stdout layer, plus an optional daily-rotated
//! file layer when `CHATRELAY_LOG_DIR` is set.

use std::{env, path::PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. The returned guard must be held for the
/// process lifetime or buffered file output is lost.
pub fn init() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,chatrelay=debug,cdp_bridge=info"));

    let stdout_layer = fmt::layer().with_target(true);

    let file_setup = env::var("CHATRELAY_LOG_DIR").ok().map(|dir| {
        let appender = tracing_appender::rolling::daily(PathBuf::from(dir), "chatrelay.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (fmt::layer().with_ansi(false).with_writer(writer), guard)
    });

    match file_setup {
        Some((file_layer, guard)) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout_layer)
                .init();
            None
        }
    }
}

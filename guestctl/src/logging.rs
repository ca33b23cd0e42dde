//! Tracing subscriber setup.

use crate::config::LogOptions;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Install a global subscriber according to `options`.
///
/// `RUST_LOG` takes precedence over `options.level`. Output goes through a
/// non-blocking writer; keep the returned guard alive for as long as logs
/// should be flushed. Installing twice is harmless, the second call keeps
/// the first subscriber.
pub fn init_logging(options: &LogOptions) -> WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.level.as_str()));

    let (non_blocking, guard) = match &options.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, &options.file_prefix);
            tracing_appender::non_blocking(appender)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    register_to_tracing(non_blocking, env_filter, options.ansi);
    guard
}

fn register_to_tracing(non_blocking: NonBlocking, env_filter: EnvFilter, ansi: bool) {
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(ansi),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_to_directory() {
        let dir = tempfile::tempdir().unwrap();
        let options = LogOptions {
            directory: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let guard = init_logging(&options);
        tracing::info!("logging initialized");
        drop(guard);
        // A second install must not panic.
        let _guard = init_logging(&LogOptions::default());
    }
}

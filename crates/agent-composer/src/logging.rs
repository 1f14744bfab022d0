use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tracing_appender::rolling::{InitError, RollingFileAppender};
use tracing_subscriber::{
    EnvFilter, Registry,
    filter::ParseError,
    fmt::writer::{BoxMakeWriter, MakeWriterExt as _},
    layer::SubscriberExt as _,
    util::{SubscriberInitExt as _, TryInitError},
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse the default log filter"))]
    DefaultFilter { source: ParseError },

    #[snafu(display("failed to initialize the rolling file appender in {directory:?}"))]
    RollingFileAppender {
        source: InitError,
        directory: PathBuf,
    },

    #[snafu(display("failed to install the global tracing subscriber"))]
    InstallSubscriber { source: TryInitError },
}

/// Format of the log lines written to stdout and the log directory.
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// Initializes `tracing` logging with the filter from the environment variable `env`, such as
/// `DATADOG_OPERATOR_LOG`. Without it, the maximum log level is INFO.
///
/// Log output is also written to a regularly rotated file when `{env}_DIRECTORY` points to a
/// directory.
pub fn initialize_logging(env: &str, app_name: &str, format: LogFormat) -> Result<()> {
    let filter = match EnvFilter::try_from_env(env) {
        Ok(env_filter) => env_filter,
        Err(_) => {
            EnvFilter::try_new(tracing::Level::INFO.to_string()).context(DefaultFilterSnafu)?
        }
    };

    let directory = std::env::var_os(format!("{env}_DIRECTORY")).map(PathBuf::from);
    let file_appender = directory
        .as_deref()
        .map(|directory| {
            RollingFileAppender::builder()
                .filename_suffix(format!("{app_name}.log"))
                .max_log_files(6)
                .build(directory)
                .context(RollingFileAppenderSnafu { directory })
        })
        .transpose()?;
    let writer = match file_appender {
        Some(file_appender) => BoxMakeWriter::new(std::io::stdout.and(file_appender)),
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let (plain, json) = match format {
        LogFormat::Plain => (
            Some(tracing_subscriber::fmt::layer().with_writer(writer)),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(tracing_subscriber::fmt::layer().json().with_writer(writer)),
        ),
    };

    Registry::default()
        .with(filter)
        .with(plain)
        .with(json)
        .try_init()
        .context(InstallSubscriberSnafu)?;

    // Only possible once the subscriber is installed.
    match directory {
        Some(directory) => tracing::info!(directory = %directory.display(), "file logging enabled"),
        None => tracing::debug!("file logging disabled, because no log directory set"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriber_is_installed_once() {
        initialize_logging("AGENT_COMPOSER_LOGGING_TEST_LOG", "agent-composer", LogFormat::Json)
            .unwrap();

        let error = initialize_logging(
            "AGENT_COMPOSER_LOGGING_TEST_LOG",
            "agent-composer",
            LogFormat::Plain,
        )
        .unwrap_err();
        assert!(matches!(error, Error::InstallSubscriber { .. }));
    }
}

use std::path::{Path, PathBuf};

use snafu::{ResultExt, Snafu};
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Registry,
    filter::ParseError,
    fmt::writer::{BoxMakeWriter, MakeWriterExt as _},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

pub mod controller;
pub mod k8s_events;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to initialize default tracing level"))]
    DefaultLevel { source: ParseError },

    #[snafu(display("failed to initialize rolling file appender in {}", directory.display()))]
    FileAppender {
        source: InitError,
        directory: PathBuf,
    },

    #[snafu(display("failed to install the global tracing subscriber"))]
    InstallSubscriber { source: TryInitError },
}

/// Number of rotated log files kept in the log directory.
const MAX_LOG_FILES: usize = 6;

/// Initializes `tracing` logging with options from the environment variable
/// given in the `env` parameter.
///
/// If the environment variable is not set, the maximum log level is INFO.
///
/// Log output can be copied to a file by setting `{env}_DIRECTORY` (e.g. `DBAAS_OPS_LOG_DIRECTORY`)
/// to a directory path. The file is rotated hourly.
pub fn initialize_logging(env: &str, app_name: &str) -> Result<(), Error> {
    let filter = match EnvFilter::try_from_env(env) {
        Ok(env_filter) => env_filter,
        Err(_) => EnvFilter::try_new(tracing::Level::INFO.to_string()).context(DefaultLevelSnafu)?,
    };

    let directory = std::env::var_os(format!("{env}_DIRECTORY")).map(PathBuf::from);
    let writer = log_writer(directory.as_deref(), app_name)?;
    Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(writer))
        .try_init()
        .context(InstallSubscriberSnafu)?;

    // need to delay logging until after tracing is initialized
    match directory {
        Some(dir) => tracing::info!(directory = %dir.display(), "file logging enabled"),
        None => tracing::debug!("file logging disabled, because no log directory set"),
    }
    Ok(())
}

/// Writes to stdout, and additionally to a rolling `{app_name}.log` file in `directory` if given.
fn log_writer(directory: Option<&Path>, app_name: &str) -> Result<BoxMakeWriter, Error> {
    let Some(directory) = directory else {
        return Ok(BoxMakeWriter::new(std::io::stdout));
    };
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::HOURLY)
        .filename_suffix(format!("{app_name}.log"))
        .max_log_files(MAX_LOG_FILES)
        .build(directory)
        .context(FileAppenderSnafu { directory })?;
    Ok(BoxMakeWriter::new(std::io::stdout.and(appender)))
}

#[cfg(test)]
mod tests {
    use std::{fs, io::Write};

    use tracing_subscriber::fmt::MakeWriter;

    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("dbaas-ops-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn log_directory_receives_a_copy_of_the_output() {
        let dir = scratch_dir("logs");

        let writer = log_writer(Some(&dir), "dbaas-ops").unwrap();
        writer
            .make_writer()
            .write_all(b"reconfigure finished\n")
            .unwrap();

        let files = fs::read_dir(&dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect::<Vec<_>>();
        assert_eq!(files.len(), 1);
        assert!(files[0].to_string_lossy().ends_with("dbaas-ops.log"));
        assert_eq!(
            fs::read_to_string(&files[0]).unwrap(),
            "reconfigure finished\n"
        );
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn without_log_directory_nothing_is_created() {
        let dir = scratch_dir("no-logs");

        let writer = log_writer(None, "dbaas-ops").unwrap();
        writer.make_writer().write_all(b"stdout only\n").unwrap();

        assert!(!dir.exists());
    }

    #[test]
    fn unusable_log_directory_is_reported() {
        let dir = scratch_dir("blocked");
        fs::write(&dir, "not a directory").unwrap();

        let err = log_writer(Some(&dir), "dbaas-ops").unwrap_err();

        assert!(matches!(err, Error::FileAppender { ref directory, .. } if *directory == dir));
        fs::remove_file(&dir).unwrap();
    }
}

//! Log filter selection and the persistent file sink.
//!
//! The binary installs the subscriber; this module only decides which
//! filters apply to the console and file layers and prepares the rolling
//! appender under `<data_dir>/logs`.

use std::fs;
use std::path::PathBuf;

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "ort=error,ffmpeg_decode_stderr=error,ffmpeg_encode_stderr=error";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "upscaler";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";

/// Subprocess stderr targets; the file sink keeps them at debug.
const FFMPEG_TARGETS: [&str; 2] = ["ffmpeg_decode_stderr", "ffmpeg_encode_stderr"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingFilterPlan {
    pub user_filter: String,
    pub console_filter: String,
    pub file_filter: String,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready {
        log_dir: PathBuf,
        appender: RollingFileAppender,
    },
    Fallback {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    pub fn log_dir(&self) -> Option<&PathBuf> {
        match self {
            Self::Ready { log_dir, .. } => Some(log_dir),
            Self::Fallback {
                attempted_log_dir, ..
            } => attempted_log_dir.as_ref(),
        }
    }
}

#[derive(Debug)]
pub struct LoggingInitPlan {
    pub filters: LoggingFilterPlan,
    pub file_sink: FileSinkPlan,
}

pub fn compose_logging_init_plan(options: &LoggingInitOptions) -> LoggingInitPlan {
    LoggingInitPlan {
        filters: compose_logging_filters(options),
        file_sink: build_file_sink_plan(options),
    }
}

/// Daily-rotated file appender under `<data_dir>/logs`, or the reason there
/// is none.
pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let retention_files = if options.retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        options.retention_files
    };

    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSinkPlan::Fallback {
            attempted_log_dir: None,
            reason: "file sink disabled: data_dir is not configured".to_string(),
        };
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let builder = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files);

    match builder.build(&log_dir) {
        Ok(appender) => FileSinkPlan::Ready { log_dir, appender },
        Err(error) => FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to initialize rolling file sink: {error}"),
        },
    }
}

/// `--log-filter` wins, then `-v`/`-vv`, then `RUST_LOG`, then the default.
/// The noise filter only applies when none of the first two was given.
pub fn compose_logging_filters(options: &LoggingInitOptions) -> LoggingFilterPlan {
    let user_filter = select_user_filter(options);
    let include_noise = options.cli_log_filter.is_none() && options.verbose == 0;

    let console_filter = merge_noise_filter(&options.noise_filter, &user_filter, include_noise);
    let file_filter = if include_noise {
        let file_noise = rewrite_noise_filter_for_file(&options.noise_filter);
        merge_noise_filter(&file_noise, &user_filter, true)
    } else {
        user_filter.clone()
    };

    LoggingFilterPlan {
        user_filter,
        console_filter,
        file_filter,
    }
}

fn select_user_filter(options: &LoggingInitOptions) -> String {
    if let Some(filter) = options.cli_log_filter.as_deref() {
        filter.to_string()
    } else if options.verbose >= 2 {
        "trace".to_string()
    } else if options.verbose == 1 {
        "debug".to_string()
    } else if let Some(filter) = options.rust_log_env.as_deref() {
        filter.to_string()
    } else {
        options.default_log_filter.clone()
    }
}

fn merge_noise_filter(noise_filter: &str, user_filter: &str, include_noise: bool) -> String {
    if include_noise && !noise_filter.trim().is_empty() {
        format!("{noise_filter},{user_filter}")
    } else {
        user_filter.to_string()
    }
}

/// Keep ffmpeg stderr at debug in the file even when the console hides it.
fn rewrite_noise_filter_for_file(noise_filter: &str) -> String {
    let mut directives: Vec<String> = Vec::new();
    let mut seen: Vec<&str> = Vec::new();

    for directive in noise_filter
        .split(',')
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
    {
        if let Some((target, _)) = directive.split_once('=') {
            let target = target.trim();
            if FFMPEG_TARGETS.contains(&target) {
                if !seen.contains(&target) {
                    directives.push(format!("{target}=debug"));
                    seen.push(target);
                }
                continue;
            }
        }
        directives.push(directive.to_string());
    }

    for target in FFMPEG_TARGETS {
        if !seen.contains(&target) {
            directives.push(format!("{target}=debug"));
        }
    }

    directives.join(",")
}

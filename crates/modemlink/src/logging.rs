use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

/// Full filter directives (`EnvFilter` syntax) that replace `--log-level`.
pub const LOG_ENV: &str = "MODEMLINK_LOG";

// Only the link layers log by default; dependencies stay quiet.
const LINK_TARGETS: [&str; 4] = [
    "modemlink",
    "modemlink_channel",
    "modemlink_queue",
    "modemlink_transport",
];

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// `warn` for everything, `self` for the link crates.
    pub fn directives(self) -> String {
        let mut directives = vec!["warn".to_string()];
        directives.extend(
            LINK_TARGETS
                .iter()
                .map(|target| format!("{target}={}", self.as_str())),
        );
        directives.join(",")
    }
}

fn filter(level: LogLevel) -> EnvFilter {
    std::env::var(LOG_ENV)
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(level.directives()))
}

pub fn init_logging(format: LogFormat, level: LogLevel) {
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter(level))
        .with_ansi(false)
        .with_target(true);

    match format {
        LogFormat::Text => {
            let _ = builder.try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().try_init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_scope_level_to_link_crates() {
        let directives = LogLevel::Debug.directives();
        assert!(directives.starts_with("warn,"));
        assert!(directives.contains("modemlink_channel=debug"));
        assert!(directives.contains("modemlink_transport=debug"));
        EnvFilter::try_new(directives).expect("directives should parse");
    }
}

use std::fmt;
use std::io;

use modemlink_channel::LinkError;
use modemlink_transport::PortError;

// Exit code constants aligned with rsfulmen/DDR-0002 semantics.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound => USAGE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn port_error(context: &str, err: PortError) -> CliError {
    match err {
        PortError::Io(source) => io_error(context, source),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn link_error(context: &str, err: LinkError) -> CliError {
    match err {
        LinkError::Transport(err) => port_error(context, err),
        LinkError::TransportFault(_) => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        LinkError::InvalidArgument(_) => CliError::new(USAGE, format!("{context}: {err}")),
        LinkError::ResourceExhausted(_) | LinkError::Framing { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        LinkError::TimedOut(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        LinkError::NotInitialized => CliError::new(FAILURE, format!("{context}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use modemlink_transport::PortFault;

    use super::*;

    #[test]
    fn link_errors_map_to_exit_codes() {
        let cases = [
            (LinkError::InvalidArgument("x".into()), USAGE),
            (LinkError::ResourceExhausted("x".into()), DATA_INVALID),
            (LinkError::Framing { index: 3 }, DATA_INVALID),
            (LinkError::TimedOut(Duration::from_secs(1)), TIMEOUT),
            (LinkError::TransportFault(PortFault::Overrun), TRANSPORT_ERROR),
            (LinkError::Transport(PortError::Busy), TRANSPORT_ERROR),
            (LinkError::NotInitialized, FAILURE),
        ];
        for (err, code) in cases {
            assert_eq!(link_error("ctx", err).code, code);
        }
    }

    #[test]
    fn port_io_errors_use_io_mapping() {
        let err = PortError::Io(io::Error::from(io::ErrorKind::PermissionDenied));
        let mapped = port_error("open failed", err);
        assert_eq!(mapped.code, PERMISSION_DENIED);
        assert!(mapped.message.starts_with("open failed: "));
    }
}

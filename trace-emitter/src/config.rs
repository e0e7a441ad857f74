use std::path::PathBuf;

use function_monitor::AddressSpace;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("argument {0:?} has no value (missing '=')")]
    MissingValue(String),

    #[error("unknown argument {0:?}")]
    UnknownKey(String),

    #[error("{key} expects true or false, found {value:?}")]
    InvalidBool { key: String, value: String },

    #[error("{key} expects an integer, found {value:?}")]
    InvalidNumber { key: String, value: String },
}

/// Settings of a [`TraceEmitter`](crate::TraceEmitter) session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmitterConfig {
    /// Path of the trace file.
    pub output: PathBuf,
    /// Record every call and return the monitor dispatches.
    pub trace_calls: bool,
    /// Log every call and return through `tracing`.
    pub log_calls: bool,
    /// Only record calls in this address space. [`AddressSpace::ANY`] records all of them.
    pub space: AddressSpace,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            output: PathBuf::from("trace.out"),
            trace_calls: true,
            log_calls: false,
            space: AddressSpace::ANY,
        }
    }
}

impl EmitterConfig {
    /// Builds a configuration from `key=value` arguments.
    ///
    /// Arguments that cannot be applied are skipped with a warning.
    pub fn from_args<'a, I>(args: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut config = Self::default();
        for arg in args {
            if let Err(err) = config.apply(arg) {
                tracing::warn!(arg = arg, error = %err, "skipping argument");
            }
        }
        config
    }

    /// Applies a single `key=value` argument.
    pub fn apply(&mut self, arg: &str) -> Result<(), ConfigError> {
        let Some((key, value)) = arg.split_once('=') else {
            return Err(ConfigError::MissingValue(String::from(arg)));
        };

        match key {
            "output" => self.output = PathBuf::from(value),
            "trace-calls" => self.trace_calls = parse_bool(key, value)?,
            "log-calls" => self.log_calls = parse_bool(key, value)?,
            "space" => {
                let space = parse_int(value).ok_or_else(|| ConfigError::InvalidNumber {
                    key: String::from(key),
                    value: String::from(value),
                })?;
                self.space = AddressSpace(space);
            }
            _ => return Err(ConfigError::UnknownKey(String::from(key))),
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key: String::from(key),
            value: String::from(value),
        }),
    }
}

/// Parses a decimal integer, or a hexadecimal one prefixed with `0x`.
pub fn parse_int(value: &str) -> Option<u64> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

//! The one place this crate returns a normal `Result`: setup-time
//! [`Config`](crate::config::Config) validation. Every other failure mode
//! described in the design doc's error taxonomy is either ordinary control
//! flow (yield/handle) or fatal (`panic!`/`abort`), never a `Result`.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    StackTooSmall { requested: usize, minimum: usize },
    GuardTooSmall { requested: usize, minimum: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::StackTooSmall { requested, minimum } => write!(
                f,
                "gstack size {requested} is smaller than the minimum of {minimum} bytes"
            ),
            ConfigError::GuardTooSmall { requested, minimum } => write!(
                f,
                "guard page size {requested} is smaller than the minimum of {minimum} bytes"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

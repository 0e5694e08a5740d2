//! Core types for byte accounting and reporting

use crate::constants::memory::{BYTES_PER_GB, BYTES_PER_KB, BYTES_PER_MB};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Reporting scale for byte counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scale {
    /// Plain bytes
    #[serde(alias = "b")]
    Bytes,
    /// Kilobytes
    #[default]
    #[serde(alias = "k", alias = "kb")]
    Kilo,
    /// Megabytes
    #[serde(alias = "m", alias = "mb")]
    Mega,
    /// Gigabytes
    #[serde(alias = "g", alias = "gb")]
    Giga,
}

impl Scale {
    /// Number of bytes in one unit of this scale
    #[must_use]
    pub const fn divisor(self) -> u64 {
        match self {
            Self::Bytes => 1,
            Self::Kilo => BYTES_PER_KB,
            Self::Mega => BYTES_PER_MB,
            Self::Giga => BYTES_PER_GB,
        }
    }

    /// Unit suffix used in reports
    #[must_use]
    pub const fn unit(self) -> &'static str {
        match self {
            Self::Bytes => "B",
            Self::Kilo => "KB",
            Self::Mega => "MB",
            Self::Giga => "GB",
        }
    }

    /// Scale a byte count, truncating toward zero
    #[must_use]
    pub const fn apply(self, bytes: u64) -> u64 {
        bytes / self.divisor()
    }
}

impl fmt::Display for Scale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.unit())
    }
}

/// Scale string could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid scale '{0}': expected one of b, k, m, g")]
pub struct ParseScaleError(pub String);

impl FromStr for Scale {
    type Err = ParseScaleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "b" | "byte" | "bytes" => Ok(Self::Bytes),
            "k" | "kb" => Ok(Self::Kilo),
            "m" | "mb" => Ok(Self::Mega),
            "g" | "gb" => Ok(Self::Giga),
            _ => Err(ParseScaleError(s.to_string())),
        }
    }
}

//! Human-readable size strings (`"12GB"`, `"512MB"`).
//!
//! Units are 1024-based. Only the fixed unit table below is accepted and the
//! unit must be upper case; anything else is a validation error.

use crate::error::{Error, Result};
use regex::Regex;
use std::sync::LazyLock;

const KB: u64 = 1024;
const MB: u64 = KB * 1024;
const GB: u64 = MB * 1024;
const TB: u64 = GB * 1024;

static SIZE_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+)([A-Z]+)\s*$").ok());

fn unit_multiplier(unit: &str) -> Option<u64> {
    match unit {
        "B" => Some(1),
        "KB" => Some(KB),
        "MB" => Some(MB),
        "GB" => Some(GB),
        "TB" => Some(TB),
        _ => None,
    }
}

/// Convert a size string such as `"12GB"` to bytes.
pub fn parse_size(input: &str) -> Result<u64> {
    let invalid = || Error::InvalidSize {
        input: input.to_string(),
    };

    let pattern = SIZE_PATTERN.as_ref().ok_or_else(invalid)?;
    let captures = pattern.captures(input).ok_or_else(invalid)?;

    let value: u64 = captures[1].parse().map_err(|_| invalid())?;
    let multiplier = unit_multiplier(&captures[2]).ok_or_else(invalid)?;

    value.checked_mul(multiplier).ok_or_else(invalid)
}

/// Convert a size string to whole mebibytes, as the VM memory setting wants.
pub fn parse_size_mib(input: &str) -> Result<u64> {
    Ok(parse_size(input)? / MB)
}

/// Convert a size string to whole kibibytes, as storage content creation wants.
pub fn parse_size_kib(input: &str) -> Result<u64> {
    Ok(parse_size(input)? / KB)
}

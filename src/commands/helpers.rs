//! Argument parsers and formatting shared by the subcommands.

use tabprep::parse_byte_suffix;

/// Parse a partition byte budget, requiring a concrete value (no "auto").
pub fn parse_partition_size_arg(s: &str) -> Result<usize, String> {
    match parse_byte_suffix(s) {
        Ok(Some(0)) => Err("partition size must be greater than 0".to_string()),
        Ok(Some(bytes)) => Ok(bytes),
        Ok(None) => Err("'auto' not supported for partition size".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

/// Parse a probability in [0, 1].
pub fn parse_fraction_arg(s: &str) -> Result<f64, String> {
    let value: f64 = s
        .parse()
        .map_err(|_| format!("'{}' is not a valid number", s))?;
    if !(0.0..=1.0).contains(&value) {
        return Err(format!("value must be in [0.0, 1.0], got {}", value));
    }
    Ok(value)
}

/// Parse a quantile in [0, 1].
pub fn parse_quantile_arg(s: &str) -> Result<f64, String> {
    parse_fraction_arg(s).map_err(|e| format!("invalid quantile: {}", e))
}

/// Format a statistic value; NaN and infinities print as-is.
pub fn format_value(v: f64) -> String {
    if v.is_finite() && v == v.trunc() && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{:.6}", v)
    }
}

use std::time::Duration;

const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

/// Parse a human size such as `512M`, `1.5G`, `20GiB` or `4096`.
///
/// Suffixes are binary (K = 1024). A bare number is bytes.
pub fn parse_bytes(value: &str) -> Result<u64, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);
    if number.is_empty() {
        return Err(format!("'{}' does not start with a number", value));
    }
    let number: f64 = number
        .parse()
        .map_err(|_| format!("'{}' is not a valid number", number))?;

    let suffix = suffix.trim().to_ascii_uppercase();
    let suffix = suffix
        .strip_suffix("IB")
        .or_else(|| suffix.strip_suffix('B'))
        .unwrap_or(suffix.as_str());
    let multiplier: u64 = match suffix {
        "" => 1,
        "K" => 1 << 10,
        "M" => 1 << 20,
        "G" => 1 << 30,
        "T" => 1 << 40,
        "P" => 1 << 50,
        other => return Err(format!("unknown size suffix '{}'", other)),
    };

    let bytes = number * multiplier as f64;
    if !bytes.is_finite() || bytes > u64::MAX as f64 {
        return Err(format!("'{}' is too large", value));
    }
    Ok(bytes as u64)
}

/// Render a byte count with a binary unit, e.g. `1.50GiB`.
pub fn format_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}B", bytes)
    } else {
        format!("{:.2}{}", value, UNITS[unit])
    }
}

pub fn format_interval(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs < 60.0 {
        format!("{:.3}s", secs)
    } else {
        let whole = duration.as_secs();
        format!("{}m{:02}s", whole / 60, whole % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bytes_suffixes() {
        assert_eq!(parse_bytes("4096").unwrap(), 4096);
        assert_eq!(parse_bytes("512M").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_bytes("1.5G").unwrap(), 3 * 512 * 1024 * 1024);
        assert_eq!(parse_bytes("20GiB").unwrap(), 20 << 30);
        assert_eq!(parse_bytes("2tb").unwrap(), 2 << 40);
        assert_eq!(parse_bytes(" 1K ").unwrap(), 1024);
    }

    #[test]
    fn test_parse_bytes_rejects_garbage() {
        assert!(parse_bytes("").is_err());
        assert!(parse_bytes("G").is_err());
        assert!(parse_bytes("10X").is_err());
        assert!(parse_bytes("1.2.3M").is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(1536), "1.50KiB");
        assert_eq!(format_bytes(10 << 30), "10.00GiB");
    }

    #[test]
    fn test_format_interval() {
        assert_eq!(format_interval(Duration::from_millis(1500)), "1.500s");
        assert_eq!(format_interval(Duration::from_secs(125)), "2m05s");
    }
}

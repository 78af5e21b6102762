//! Wall-clock limit parsing and formatting.

/// Parse a time limit into seconds.
///
/// Accepts unit-suffixed values (`30s`, `10m`, `2h`, `1d`, and combinations
/// like `1h30m`), bare seconds (`600`), and colon notation (`MM:SS`,
/// `HH:MM:SS`, `D-HH:MM:SS`).
pub fn duration_string_to_seconds(value: &str) -> Result<u64, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("empty time limit".to_string());
    }

    if value.contains(':') {
        return parse_colon_notation(value);
    }

    if let Ok(secs) = value.parse::<u64>() {
        return Ok(secs);
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    for c in value.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let multiplier = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86_400,
            _ => return Err(format!("invalid time limit '{}': unknown unit '{}'", value, c)),
        };
        if digits.is_empty() {
            return Err(format!("invalid time limit '{}': unit without a number", value));
        }
        let n: u64 = digits
            .parse()
            .map_err(|e| format!("invalid time limit '{}': {}", value, e))?;
        total += n * multiplier;
        digits.clear();
    }
    if !digits.is_empty() {
        return Err(format!("invalid time limit '{}': trailing number without unit", value));
    }
    Ok(total)
}

fn parse_colon_notation(value: &str) -> Result<u64, String> {
    let (days, rest) = match value.split_once('-') {
        Some((d, rest)) => (
            d.parse::<u64>()
                .map_err(|e| format!("invalid time limit '{}': {}", value, e))?,
            rest,
        ),
        None => (0, value),
    };

    let parts = rest
        .split(':')
        .map(|p| p.parse::<u64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid time limit '{}': {}", value, e))?;

    let secs = match parts.as_slice() {
        [m, s] => m * 60 + s,
        [h, m, s] => h * 3600 + m * 60 + s,
        _ => return Err(format!("invalid time limit '{}'", value)),
    };
    Ok(days * 86_400 + secs)
}

/// Format seconds as `HH:MM:SS` (hours may exceed 24), the form PBS accepts
/// for `walltime`.
pub fn format_hms(secs: u64) -> String {
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let s = secs % 60;
    format!("{:02}:{:02}:{:02}", hours, mins, s)
}

/// Format seconds as Slurm's `D-HH:MM:SS` once a day is exceeded.
pub fn format_slurm_time(secs: u64) -> String {
    let hours = secs / 3600;
    if hours >= 24 {
        let mins = (secs % 3600) / 60;
        format!("{}-{:02}:{:02}:{:02}", hours / 24, hours % 24, mins, secs % 60)
    } else {
        format_hms(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_suffixes() {
        assert_eq!(duration_string_to_seconds("10m").unwrap(), 600);
        assert_eq!(duration_string_to_seconds("2h").unwrap(), 7200);
        assert_eq!(duration_string_to_seconds("30s").unwrap(), 30);
        assert_eq!(duration_string_to_seconds("1h30m").unwrap(), 5400);
        assert_eq!(duration_string_to_seconds("1d").unwrap(), 86_400);
    }

    #[test]
    fn test_bare_and_colon_notation() {
        assert_eq!(duration_string_to_seconds("600").unwrap(), 600);
        assert_eq!(duration_string_to_seconds("00:15:00").unwrap(), 900);
        assert_eq!(duration_string_to_seconds("10:30").unwrap(), 630);
        assert_eq!(duration_string_to_seconds("1-02:00:00").unwrap(), 93_600);
    }

    #[test]
    fn test_invalid_values() {
        assert!(duration_string_to_seconds("").is_err());
        assert!(duration_string_to_seconds("10x").is_err());
        assert!(duration_string_to_seconds("h").is_err());
        assert!(duration_string_to_seconds("1h30").is_err());
        assert!(duration_string_to_seconds("1:2:3:4").is_err());
    }

    #[test]
    fn test_formatting() {
        assert_eq!(format_hms(600), "00:10:00");
        assert_eq!(format_hms(93_600), "26:00:00");
        assert_eq!(format_slurm_time(3600), "01:00:00");
        assert_eq!(format_slurm_time(93_600), "1-02:00:00");
    }
}

//! Human-readable durations: "500ms", "15s", "2m", "1h", "15d".

use std::time::Duration;

/// Parse a duration string like "5s", "500ms", "2m", "1h" or "7d".
///
/// A bare number is read as seconds. Returns `None` for anything else.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        return ms.parse::<u64>().ok().map(Duration::from_millis);
    }
    let (digits, unit) = match s.char_indices().last()? {
        (i, c) if c.is_ascii_alphabetic() => (&s[..i], c),
        _ => (s, 's'),
    };
    let value = digits.parse::<u64>().ok()?;
    let secs = match unit {
        's' => value,
        'm' => value.checked_mul(60)?,
        'h' => value.checked_mul(3600)?,
        'd' => value.checked_mul(86_400)?,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

/// Whether `s` is a SLURM time limit: `MM`, `MM:SS`, `HH:MM:SS`,
/// `D-HH`, `D-HH:MM` or `D-HH:MM:SS`.
pub fn is_slurm_time_limit(s: &str) -> bool {
    let (days, clock) = match s.split_once('-') {
        Some((d, rest)) => (Some(d), rest),
        None => (None, s),
    };
    if let Some(d) = days {
        if d.is_empty() || !d.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
    }
    let parts: Vec<&str> = clock.split(':').collect();
    if parts.len() > 3 {
        return false;
    }
    parts
        .iter()
        .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_units() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("15s"), Some(Duration::from_secs(15)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("15d"), Some(Duration::from_secs(15 * 86_400)));
        assert_eq!(parse_duration(" 30 "), Some(Duration::from_secs(30)));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("s"), None);
        assert_eq!(parse_duration("ten seconds"), None);
        assert_eq!(parse_duration("5w"), None);
        assert_eq!(parse_duration("-5s"), None);
    }

    #[test]
    fn slurm_time_limits() {
        assert!(is_slurm_time_limit("04:00:00"));
        assert!(is_slurm_time_limit("30"));
        assert!(is_slurm_time_limit("1-12:00:00"));
        assert!(is_slurm_time_limit("2-06"));
        assert!(!is_slurm_time_limit(""));
        assert!(!is_slurm_time_limit("four hours"));
        assert!(!is_slurm_time_limit("1:2:3:4"));
        assert!(!is_slurm_time_limit("-04:00:00"));
    }
}

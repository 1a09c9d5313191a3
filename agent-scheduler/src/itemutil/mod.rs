//! Item key and update interval helpers.
//!
//! Keys follow the `name[param1,"param,2",...]` form. Only as much of the
//! grammar is supported as the scheduler needs to route a key to its plugin
//! and hand the parameters over; nested array parameters are not parsed.

use chrono::{DateTime, TimeZone, Utc};

use crate::{Error, Result};

/// Refresh interval for items that the plugin reported as unsupported.
pub const REFRESH_UNSUPPORTED_SECS: i64 = 600;

/// Longest simple update interval accepted.
pub const MAX_DELAY_SECS: i64 = 86_400;

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

/// Splits an item key into its name and parameters.
pub fn parse_key(key: &str) -> Result<(String, Vec<String>)> {
    let name_end = key.find(|c: char| !is_key_char(c)).unwrap_or(key.len());
    if name_end == 0 {
        return Err(Error::invalid_key(format!("{key}: missing key name")));
    }

    let name = key[..name_end].to_string();
    let rest = &key[name_end..];
    if rest.is_empty() {
        return Ok((name, Vec::new()));
    }

    match rest.strip_prefix('[') {
        Some(body) => Ok((name, parse_params(key, body)?)),
        None => Err(Error::invalid_key(format!(
            "{key}: invalid character at position {name_end}"
        ))),
    }
}

fn parse_params(key: &str, body: &str) -> Result<Vec<String>> {
    let mut params = Vec::new();
    let mut chars = body.char_indices().peekable();

    loop {
        while chars.next_if(|&(_, c)| c == ' ').is_some() {}

        let mut value = String::new();
        if chars.next_if(|&(_, c)| c == '"').is_some() {
            let mut closed = false;
            while let Some((_, c)) = chars.next() {
                match c {
                    '\\' if chars.next_if(|&(_, c)| c == '"').is_some() => value.push('"'),
                    '"' => {
                        closed = true;
                        break;
                    }
                    c => value.push(c),
                }
            }
            if !closed {
                return Err(Error::invalid_key(format!("{key}: unterminated quoted parameter")));
            }
            while chars.next_if(|&(_, c)| c == ' ').is_some() {}
        } else {
            while let Some((_, c)) = chars.next_if(|&(_, c)| c != ',' && c != ']') {
                value.push(c);
            }
        }
        params.push(value);

        match chars.next() {
            Some((_, ',')) => continue,
            Some((pos, ']')) if pos + 1 == body.len() => return Ok(params),
            Some((_, ']')) => {
                return Err(Error::invalid_key(format!("{key}: characters after parameters")));
            }
            _ => return Err(Error::invalid_key(format!("{key}: missing closing bracket"))),
        }
    }
}

/// Parses the simple interval part of an update interval definition.
///
/// Anything after the first `;` (flexible or scheduling intervals) is ignored.
/// A numeric value may carry one of the `s`, `m`, `h`, `d` or `w` suffixes.
pub fn parse_delay(delay: &str) -> Result<i64> {
    let simple = delay.split(';').next().unwrap_or_default().trim();

    let (digits, multiplier) = match simple.char_indices().last() {
        Some((pos, unit)) if unit.is_ascii_alphabetic() => {
            let multiplier = match unit {
                's' => 1,
                'm' => 60,
                'h' => 3_600,
                'd' => 86_400,
                'w' => 604_800,
                _ => return Err(Error::invalid_delay(delay)),
            };
            (&simple[..pos], multiplier)
        }
        _ => (simple, 1),
    };

    let value: i64 = digits.parse().map_err(|_| Error::invalid_delay(delay))?;
    let seconds = value
        .checked_mul(multiplier)
        .ok_or_else(|| Error::invalid_delay(delay))?;

    if seconds <= 0 || seconds > MAX_DELAY_SECS {
        return Err(Error::invalid_delay(delay));
    }
    Ok(seconds)
}

/// Returns the first check time strictly after `from` on the interval grid.
///
/// Unsupported items are polled on the slower refresh grid instead.
pub fn next_check(delay: &str, unsupported: bool, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let period = if unsupported {
        REFRESH_UNSUPPORTED_SECS
    } else {
        parse_delay(delay)?
    };

    let seconds = from.timestamp();
    let next = period * seconds.div_euclid(period) + period;
    Utc.timestamp_opt(next, 0)
        .single()
        .ok_or_else(|| Error::invalid_delay(delay))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_parse_plain_key() {
        let (name, params) = parse_key("system.cpu.load").unwrap();
        assert_eq!(name, "system.cpu.load");
        assert!(params.is_empty());
    }

    #[test]
    fn test_parse_key_params() {
        let (name, params) = parse_key(r#"vfs.fs.size[/, "free,pct", "a\"b"]"#).unwrap();
        assert_eq!(name, "vfs.fs.size");
        assert_eq!(params, vec!["/", "free,pct", "a\"b"]);
    }

    #[test]
    fn test_parse_key_empty_params() {
        let (name, params) = parse_key("debug[]").unwrap();
        assert_eq!(name, "debug");
        assert_eq!(params, vec![""]);

        let (_, params) = parse_key("debug[,2]").unwrap();
        assert_eq!(params, vec!["", "2"]);
    }

    #[rstest]
    #[case("")]
    #[case("[1]")]
    #[case("debug[1")]
    #[case("debug[1]x")]
    #[case("debug x")]
    #[case("debug[\"1]")]
    fn test_parse_key_invalid(#[case] key: &str) {
        assert!(matches!(parse_key(key), Err(Error::InvalidKey(_))));
    }

    #[rstest]
    #[case("1", 1)]
    #[case("30s", 30)]
    #[case("5m", 300)]
    #[case("1h", 3_600)]
    #[case("1d", 86_400)]
    #[case("10;50/1-7,00:00-24:00", 10)]
    #[case(" 15 ", 15)]
    fn test_parse_delay(#[case] delay: &str, #[case] expected: i64) {
        assert_eq!(parse_delay(delay).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("0")]
    #[case("-5")]
    #[case("x")]
    #[case("5x")]
    #[case("2d")]
    #[case("1w")]
    fn test_parse_delay_invalid(#[case] delay: &str) {
        assert!(matches!(parse_delay(delay), Err(Error::InvalidDelay(_))));
    }

    #[test]
    fn test_next_check_aligns_to_grid() {
        let from = Utc.timestamp_opt(1_700_000_003, 500_000_000).unwrap();
        assert_eq!(
            next_check("5", false, from).unwrap(),
            Utc.timestamp_opt(1_700_000_005, 0).unwrap()
        );

        let on_grid = Utc.timestamp_opt(1_700_000_005, 0).unwrap();
        assert_eq!(
            next_check("5", false, on_grid).unwrap(),
            Utc.timestamp_opt(1_700_000_010, 0).unwrap()
        );
    }

    #[test]
    fn test_next_check_unsupported_uses_refresh() {
        let from = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let next = next_check("1", true, from).unwrap();
        assert_eq!(next.timestamp() % REFRESH_UNSUPPORTED_SECS, 0);
        assert!(next > from);
        assert!(next.timestamp() - from.timestamp() <= REFRESH_UNSUPPORTED_SECS);
    }
}

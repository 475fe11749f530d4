//! Go-style duration strings (`"250ms"`, `"5m"`, `"1h30m"`).

use std::time::Duration;

use serde::{Deserialize, Deserializer};

const NANOS_PER_UNIT: &[(&str, u64)] = &[
    ("ns", 1),
    ("us", 1_000),
    ("µs", 1_000),
    ("μs", 1_000),
    ("ms", 1_000_000),
    ("s", 1_000_000_000),
    ("m", 60 * 1_000_000_000),
    ("h", 60 * 60 * 1_000_000_000),
];

/// Parses a duration written as a sequence of decimal numbers each followed
/// by a unit, e.g. `"1h30m"` or `"1.5s"`. A bare `"0"` is accepted.
pub(crate) fn parse(text: &str) -> Result<Duration, String> {
    let original = text;
    let text = text.trim();
    let text = text.strip_prefix('+').unwrap_or(text);
    if text == "0" {
        return Ok(Duration::ZERO);
    }
    if text.is_empty() {
        return Err(format!("invalid duration {original:?}"));
    }
    if text.starts_with('-') {
        return Err(format!("negative duration {original:?}"));
    }

    let mut rest = text;
    let mut total: u128 = 0;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(number_len);
        if number.is_empty() || number == "." {
            return Err(format!("invalid duration {original:?}"));
        }
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        let Some(&(_, scale)) =
            NANOS_PER_UNIT.iter().find(|(name, _)| *name == unit)
        else {
            return Err(if unit.is_empty() {
                format!("missing unit in duration {original:?}")
            } else {
                format!("unknown unit {unit:?} in duration {original:?}")
            });
        };

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole
                .parse()
                .map_err(|_| format!("invalid duration {original:?}"))?
        };
        let mut nanos = whole
            .checked_mul(u128::from(scale))
            .ok_or_else(|| format!("duration {original:?} overflows"))?;
        if !fraction.is_empty() {
            let digits: f64 = format!("0.{fraction}")
                .parse()
                .map_err(|_| format!("invalid duration {original:?}"))?;
            nanos = nanos
                .checked_add((digits * scale as f64) as u128)
                .ok_or_else(|| format!("duration {original:?} overflows"))?;
        }
        total = total
            .checked_add(nanos)
            .ok_or_else(|| format!("duration {original:?} overflows"))?;
        rest = tail;
    }

    let secs = u64::try_from(total / 1_000_000_000)
        .map_err(|_| format!("duration {original:?} overflows"))?;
    Ok(Duration::new(secs, (total % 1_000_000_000) as u32))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Raw {
    Text(String),
    Seconds(u64),
}

/// `deserialize_with` helper accepting a duration string or whole seconds.
pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match Raw::deserialize(deserializer)? {
        Raw::Text(text) => parse(&text).map_err(serde::de::Error::custom),
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
    }
}

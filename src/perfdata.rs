//! Parser for the performance-data section of plugin output
//!
//! The format is the usual monitoring-plugin one:
//! `'name'=value[unit];warn;crit;min;max` tokens separated by spaces, where
//! warn and crit may be ranges (`[@]low:high`) and any numeric field may be
//! empty, `U`, `nan` or infinite.

use std::fmt;

/// How a metric's samples are to be interpreted over time
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MetricType {
    Gauge,
    Counter,
    Derive,
    Absolute,
    /// No marker in the perfdata; the storage layer keeps whatever type the
    /// metric already has.
    Automatic,
}

impl MetricType {
    pub fn as_i16(&self) -> i16 {
        match self {
            MetricType::Gauge => 0,
            MetricType::Counter => 1,
            MetricType::Derive => 2,
            MetricType::Absolute => 3,
            MetricType::Automatic => 4,
        }
    }

    pub fn from_i16(v: i16) -> MetricType {
        match v {
            1 => MetricType::Counter,
            2 => MetricType::Derive,
            3 => MetricType::Absolute,
            4 => MetricType::Automatic,
            _ => MetricType::Gauge,
        }
    }
}

/// One parsed metric sample
#[derive(Debug, Clone)]
pub struct Perfdata {
    pub name: String,
    pub unit: String,
    pub value: f64,
    pub value_type: MetricType,
    pub warn: f64,
    pub warn_low: f64,
    pub warn_mode: bool,
    pub crit: f64,
    pub crit_low: f64,
    pub crit_mode: bool,
    pub min: f64,
    pub max: f64,
}

impl Default for Perfdata {
    fn default() -> Self {
        Perfdata {
            name: String::new(),
            unit: String::new(),
            value: f64::NAN,
            value_type: MetricType::Gauge,
            warn: f64::NAN,
            warn_low: f64::NAN,
            warn_mode: false,
            crit: f64::NAN,
            crit_low: f64::NAN,
            crit_mode: false,
            min: f64::NAN,
            max: f64::NAN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerfdataError {
    pub message: String,
}

impl fmt::Display for PerfdataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid perfdata: {}", self.message)
    }
}

impl std::error::Error for PerfdataError {}

fn err(message: impl Into<String>) -> PerfdataError {
    PerfdataError {
        message: message.into(),
    }
}

/// Floating-point comparison used to decide whether a metric sample changed.
/// NaN equals NaN and same-sign infinities are equal, so an untouched metric
/// never triggers a database write.
pub fn float_equal(a: f64, b: f64) -> bool {
    const EPSILON: f64 = 0.00001;
    if a.is_nan() && b.is_nan() {
        return true;
    }
    if a.is_infinite() || b.is_infinite() {
        return a == b;
    }
    (a - b).abs() < EPSILON
}

/// Parse a full perfdata string into its samples
pub fn parse_perfdata(input: &str) -> Result<Vec<Perfdata>, PerfdataError> {
    let mut out = Vec::new();
    let mut rest = input.trim_start();
    while !rest.is_empty() {
        let (sample, tail) = parse_one(rest)?;
        out.push(sample);
        rest = tail.trim_start();
    }
    Ok(out)
}

fn parse_one(input: &str) -> Result<(Perfdata, &str), PerfdataError> {
    let (name, rest) = parse_name(input)?;
    if name.is_empty() {
        return Err(err(format!("empty metric name near '{}'", truncated(input))));
    }

    let mut sample = Perfdata {
        name,
        ..Default::default()
    };

    // Optional type marker: d[...], c[...], a[...], g[...]
    let mut rest = rest;
    let mut bracketed = false;
    if rest.len() >= 2 {
        let marker = &rest[..2];
        let value_type = match marker {
            "d[" => Some(MetricType::Derive),
            "c[" => Some(MetricType::Counter),
            "a[" => Some(MetricType::Absolute),
            "g[" => Some(MetricType::Gauge),
            _ => None,
        };
        if let Some(value_type) = value_type {
            sample.value_type = value_type;
            rest = &rest[2..];
            bracketed = true;
        }
    }

    let (value, mut rest) = parse_number(rest)?;
    sample.value = value;
    if bracketed {
        rest = rest
            .strip_prefix(']')
            .ok_or_else(|| err(format!("unclosed type marker in '{}'", sample.name)))?;
    }

    // Unit runs until a separator.
    let unit_len = rest
        .find(|c: char| c == ';' || c.is_whitespace())
        .unwrap_or(rest.len());
    sample.unit = rest[..unit_len].to_string();
    rest = &rest[unit_len..];

    for field in 0..4 {
        let Some(tail) = rest.strip_prefix(';') else { break };
        rest = tail;
        let len = rest
            .find(|c: char| c == ';' || c.is_whitespace())
            .unwrap_or(rest.len());
        let raw = &rest[..len];
        rest = &rest[len..];
        if raw.is_empty() {
            continue;
        }
        match field {
            0 => {
                let (low, high, inclusive) = parse_range(raw, &sample.name)?;
                sample.warn_low = low;
                sample.warn = high;
                sample.warn_mode = inclusive;
            }
            1 => {
                let (low, high, inclusive) = parse_range(raw, &sample.name)?;
                sample.crit_low = low;
                sample.crit = high;
                sample.crit_mode = inclusive;
            }
            2 => sample.min = parse_scalar(raw, &sample.name)?,
            _ => sample.max = parse_scalar(raw, &sample.name)?,
        }
    }

    Ok((sample, rest))
}

fn parse_name(input: &str) -> Result<(String, &str), PerfdataError> {
    if let Some(rest) = input.strip_prefix('\'') {
        let end = rest
            .find('\'')
            .ok_or_else(|| err(format!("unterminated quote near '{}'", truncated(input))))?;
        let name = rest[..end].to_string();
        let rest = rest[end + 1..]
            .strip_prefix('=')
            .ok_or_else(|| err(format!("missing '=' after '{}'", name)))?;
        Ok((name, rest))
    } else {
        let eq = input
            .find('=')
            .ok_or_else(|| err(format!("missing '=' near '{}'", truncated(input))))?;
        Ok((input[..eq].trim().to_string(), &input[eq + 1..]))
    }
}

/// Parse a leading float, accepting `U`, `nan`, `inf` and `-inf`
fn parse_number(input: &str) -> Result<(f64, &str), PerfdataError> {
    for (special, value) in [
        ("U", f64::NAN),
        ("nan", f64::NAN),
        ("-inf", f64::NEG_INFINITY),
        ("inf", f64::INFINITY),
    ] {
        if let Some(rest) = input.strip_prefix(special) {
            return Ok((value, rest));
        }
    }
    let len = input
        .char_indices()
        .take_while(|(i, c)| {
            c.is_ascii_digit()
                || *c == '.'
                || ((*c == '+' || *c == '-') && (*i == 0 || input.as_bytes()[i - 1] == b'e'))
                || *c == 'e'
                || *c == 'E'
        })
        .count();
    if len == 0 {
        return Err(err(format!("no number near '{}'", truncated(input))));
    }
    let value: f64 = input[..len]
        .parse()
        .map_err(|_| err(format!("bad number '{}'", &input[..len])))?;
    Ok((value, &input[len..]))
}

fn parse_scalar(raw: &str, name: &str) -> Result<f64, PerfdataError> {
    let (value, rest) = parse_number(raw)?;
    if !rest.is_empty() {
        return Err(err(format!("trailing garbage in field of '{}'", name)));
    }
    Ok(value)
}

/// Parse a threshold: plain value, `low:high`, `low:`, `:high` or `~:high`,
/// optionally prefixed with `@` for an inclusive range
fn parse_range(raw: &str, name: &str) -> Result<(f64, f64, bool), PerfdataError> {
    let (raw, inclusive) = match raw.strip_prefix('@') {
        Some(rest) => (rest, true),
        None => (raw, false),
    };
    match raw.split_once(':') {
        None => Ok((0.0, parse_scalar(raw, name)?, inclusive)),
        Some((low, high)) => {
            let low = if low.is_empty() || low == "~" {
                f64::NEG_INFINITY
            } else {
                parse_scalar(low, name)?
            };
            let high = if high.is_empty() {
                f64::INFINITY
            } else {
                parse_scalar(high, name)?
            };
            Ok((low, high, inclusive))
        }
    }
}

fn truncated(input: &str) -> &str {
    &input[..input.len().min(16)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_simple_metric() {
        let list = parse_perfdata("time=2.45").unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "time");
        assert_eq!(list[0].value, 2.45);
        assert_eq!(list[0].value_type, MetricType::Gauge);
        assert!(list[0].warn.is_nan());
    }

    #[test]
    fn parses_full_token() {
        let list = parse_perfdata("'used space'=73MB;80;90;0;100").unwrap();
        let p = &list[0];
        assert_eq!(p.name, "used space");
        assert_eq!(p.value, 73.0);
        assert_eq!(p.unit, "MB");
        assert_eq!(p.warn, 80.0);
        assert_eq!(p.warn_low, 0.0);
        assert_eq!(p.crit, 90.0);
        assert_eq!(p.min, 0.0);
        assert_eq!(p.max, 100.0);
    }

    #[test]
    fn parses_multiple_tokens() {
        let list = parse_perfdata("a=1 b=2;3 c=4;;5").unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[1].warn, 3.0);
        assert!(list[2].warn.is_nan());
        assert_eq!(list[2].crit, 5.0);
    }

    #[test]
    fn parses_type_markers() {
        let list = parse_perfdata("traffic=d[42.5]B/s counter=c[7]").unwrap();
        assert_eq!(list[0].value_type, MetricType::Derive);
        assert_eq!(list[0].value, 42.5);
        assert_eq!(list[0].unit, "B/s");
        assert_eq!(list[1].value_type, MetricType::Counter);
    }

    #[test]
    fn parses_ranges() {
        let list = parse_perfdata("load=5;@10:20;~:30").unwrap();
        let p = &list[0];
        assert!(p.warn_mode);
        assert_eq!(p.warn_low, 10.0);
        assert_eq!(p.warn, 20.0);
        assert!(!p.crit_mode);
        assert_eq!(p.crit_low, f64::NEG_INFINITY);
        assert_eq!(p.crit, 30.0);
    }

    #[test]
    fn parses_undetermined_values() {
        let list = parse_perfdata("x=U;;;inf;-inf").unwrap();
        assert!(list[0].value.is_nan());
        assert_eq!(list[0].min, f64::INFINITY);
        assert_eq!(list[0].max, f64::NEG_INFINITY);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_perfdata("no equal sign").is_err());
        assert!(parse_perfdata("'unterminated=2").is_err());
        assert!(parse_perfdata("x=notanumber").is_err());
    }

    #[test]
    fn float_equal_handles_specials() {
        assert!(float_equal(f64::NAN, f64::NAN));
        assert!(float_equal(f64::INFINITY, f64::INFINITY));
        assert!(!float_equal(f64::INFINITY, f64::NEG_INFINITY));
        assert!(!float_equal(f64::NAN, 1.0));
        assert!(float_equal(1.0, 1.0 + 1e-7));
        assert!(!float_equal(1.0, 1.1));
    }

    proptest! {
        #[test]
        fn float_equal_is_reflexive(v in proptest::num::f64::ANY) {
            prop_assert!(float_equal(v, v));
        }

        #[test]
        fn float_equal_is_symmetric(a in proptest::num::f64::ANY, b in proptest::num::f64::ANY) {
            prop_assert_eq!(float_equal(a, b), float_equal(b, a));
        }

        #[test]
        fn far_values_differ(v in -1.0e6_f64..1.0e6) {
            prop_assert!(!float_equal(v, v + 1.0));
        }

        #[test]
        fn roundtrips_plain_values(v in -1.0e9_f64..1.0e9) {
            let text = format!("m={v}");
            let list = parse_perfdata(&text).unwrap();
            prop_assert!(float_equal(list[0].value, v) || (list[0].value - v).abs() < 1e-6);
        }
    }
}

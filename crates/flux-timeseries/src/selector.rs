use crate::model::AggregationType;
use chrono::Duration;
use flux_core::{FluxError, Result};
use flux_types::{is_valid_label_name, is_valid_metric_name, Labels};
use std::fmt;
use std::str::FromStr;

/// 即时查询的默认时间窗口
pub const DEFAULT_RANGE_SECS: i64 = 300;

/// 查询选择器
///
/// 支持的形式：`metric`、`metric{k="v",...}`、`agg(metric{...})`，
/// 以及可选的时间窗口后缀 `[5m]`。
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    pub metric: String,
    pub matchers: Labels,
    pub aggregation: Option<AggregationType>,
    pub range: Option<Duration>,
}

impl Selector {
    pub fn new(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            matchers: Labels::new(),
            aggregation: None,
            range: None,
        }
    }

    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(FluxError::Query("empty query".to_string()));
        }

        let (body, outer_range) = split_range(input)?;

        let (aggregation, inner) = match body.find('(') {
            Some(open) => {
                let inner = body[open + 1..]
                    .strip_suffix(')')
                    .ok_or_else(|| FluxError::Query(format!("unbalanced parentheses in '{}'", input)))?;
                let name = body[..open].trim();
                let aggregation = name
                    .parse::<AggregationType>()
                    .map_err(FluxError::Query)?;
                (Some(aggregation), inner.trim())
            }
            None => (None, body),
        };

        let (inner, inner_range) = split_range(inner)?;
        let range = match (outer_range, inner_range) {
            (Some(_), Some(_)) => {
                return Err(FluxError::Query(format!("duplicate range in '{}'", input)));
            }
            (a, b) => a.or(b),
        };

        let (metric, matchers) = match inner.find('{') {
            Some(open) => {
                let body = inner[open + 1..]
                    .strip_suffix('}')
                    .ok_or_else(|| FluxError::Query(format!("unterminated label matcher in '{}'", input)))?;
                (inner[..open].trim(), parse_matchers(body)?)
            }
            None => (inner.trim(), Labels::new()),
        };

        if !is_valid_metric_name(metric) {
            return Err(FluxError::Query(format!("invalid metric name '{}'", metric)));
        }

        Ok(Self {
            metric: metric.to_string(),
            matchers,
            aggregation,
            range,
        })
    }

    /// 时间窗口，未指定时为 5 分钟
    pub fn range_or_default(&self) -> Duration {
        self.range
            .unwrap_or_else(|| Duration::seconds(DEFAULT_RANGE_SECS))
    }
}

impl FromStr for Selector {
    type Err = FluxError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(agg) = self.aggregation {
            write!(f, "{}(", agg)?;
        }
        f.write_str(&self.metric)?;
        if !self.matchers.is_empty() {
            write!(f, "{{{}}}", flux_types::labels_key(&self.matchers))?;
        }
        if self.aggregation.is_some() {
            f.write_str(")")?;
        }
        if let Some(range) = self.range {
            write!(f, "[{}s]", range.num_seconds())?;
        }
        Ok(())
    }
}

/// 拆分尾部的 `[duration]`
fn split_range(input: &str) -> Result<(&str, Option<Duration>)> {
    let input = input.trim();
    if !input.ends_with(']') {
        return Ok((input, None));
    }
    let open = input
        .rfind('[')
        .ok_or_else(|| FluxError::Query(format!("unbalanced brackets in '{}'", input)))?;
    let range = parse_duration(&input[open + 1..input.len() - 1])?;
    Ok((input[..open].trim_end(), Some(range)))
}

fn parse_matchers(body: &str) -> Result<Labels> {
    let mut labels = Labels::new();
    let mut chars = body.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut name = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                name.push(c);
                chars.next();
            } else {
                break;
            }
        }
        if !is_valid_label_name(&name) {
            return Err(FluxError::Query(format!("invalid label name '{}'", name)));
        }

        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        match chars.next() {
            Some('=') => {}
            other => {
                return Err(FluxError::Query(format!(
                    "expected '=' after label '{}', found {:?}",
                    name, other
                )));
            }
        }
        if matches!(chars.peek(), Some('~') | Some('=')) {
            return Err(FluxError::Query(format!(
                "unsupported matcher for label '{}': only exact match is supported",
                name
            )));
        }
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        if chars.next() != Some('"') {
            return Err(FluxError::Query(format!("label '{}' value must be quoted", name)));
        }

        let mut value = String::new();
        let mut closed = false;
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some(escaped) => value.push(escaped),
                    None => break,
                },
                '"' => {
                    closed = true;
                    break;
                }
                c => value.push(c),
            }
        }
        if !closed {
            return Err(FluxError::Query(format!("unterminated value for label '{}'", name)));
        }

        labels.insert(name, value);

        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        match chars.peek() {
            None | Some(',') => {}
            Some(c) => {
                return Err(FluxError::Query(format!("unexpected '{}' in label matcher", c)));
            }
        }
    }

    Ok(labels)
}

/// 解析时长，例如 `30s`、`5m`、`1h`、`7d`、`500ms`
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(split);

    let amount: i64 = digits
        .parse()
        .map_err(|_| FluxError::Query(format!("invalid duration '{}'", input)))?;

    let duration = match unit {
        "ms" => Duration::milliseconds(amount),
        "s" | "" => Duration::seconds(amount),
        "m" => Duration::minutes(amount),
        "h" => Duration::hours(amount),
        "d" => Duration::days(amount),
        "w" => Duration::weeks(amount),
        _ => return Err(FluxError::Query(format!("invalid duration unit in '{}'", input))),
    };

    if duration <= Duration::zero() {
        return Err(FluxError::Query(format!("duration must be positive: '{}'", input)));
    }
    Ok(duration)
}

//! 告警模板渲染
//!
//! 模板中的 `{{ ... }}` 会被解析为固定的几类占位符：
//! `$value`（可接 `| humanize` 等格式化器）、`$labels.<key>`、
//! `$annotations.<key>`、`$alert.<field>`。无法识别的表达式、未知格式化器
//! 和未闭合的花括号原样输出，渲染不会失败。

use crate::message::RenderedContent;
use flux_types::{Alert, AlertAction, ChannelType};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Formatter {
    Humanize,
    HumanizePercentage,
    HumanizeBytes,
    HumanizeDuration,
}

impl Formatter {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "humanize" => Some(Self::Humanize),
            "humanizePercentage" => Some(Self::HumanizePercentage),
            "humanizeBytes" => Some(Self::HumanizeBytes),
            "humanizeDuration" => Some(Self::HumanizeDuration),
            _ => None,
        }
    }

    fn apply(self, value: f64) -> String {
        if !value.is_finite() {
            return value.to_string();
        }
        match self {
            Self::Humanize => humanize(value),
            Self::HumanizePercentage => format!("{}%", trim_float(value * 100.0, 2)),
            Self::HumanizeBytes => humanize_bytes(value),
            Self::HumanizeDuration => humanize_duration(value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AlertField {
    Name,
    Status,
    Severity,
    Fingerprint,
    StartsAt,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(String),
    Value(Option<Formatter>),
    Label(String),
    Annotation(String),
    Alert(AlertField),
}

/// 解析后的模板
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    tokens: Vec<Token>,
}

impl Template {
    pub fn parse(source: &str) -> Self {
        let mut tokens = Vec::new();
        let mut rest = source;

        while let Some(open) = rest.find("{{") {
            let after = &rest[open + 2..];
            let Some(close) = after.find("}}") else {
                break;
            };

            push_literal(&mut tokens, &rest[..open]);
            match parse_expr(after[..close].trim()) {
                Some(token) => tokens.push(token),
                None => push_literal(&mut tokens, &rest[open..open + close + 4]),
            }
            rest = &after[close + 2..];
        }
        push_literal(&mut tokens, rest);

        Self { tokens }
    }

    pub fn render(&self, alert: &Alert) -> String {
        let mut out = String::new();
        for token in &self.tokens {
            match token {
                Token::Literal(text) => out.push_str(text),
                Token::Value(None) => out.push_str(&alert.value.to_string()),
                Token::Value(Some(formatter)) => out.push_str(&formatter.apply(alert.value)),
                Token::Label(key) => {
                    if let Some(v) = alert.labels.get(key) {
                        out.push_str(v);
                    }
                }
                Token::Annotation(key) => {
                    if let Some(v) = alert.annotations.get(key) {
                        out.push_str(v);
                    }
                }
                Token::Alert(field) => match field {
                    AlertField::Name => out.push_str(&alert.rule_name),
                    AlertField::Status => out.push_str(&alert.status.to_string()),
                    AlertField::Severity => out.push_str(&alert.severity.to_string()),
                    AlertField::Fingerprint => out.push_str(&alert.fingerprint),
                    AlertField::StartsAt => out.push_str(&alert.starts_at.to_rfc3339()),
                },
            }
        }
        out
    }
}

/// 解析并渲染一段模板文本
pub fn render(source: &str, alert: &Alert) -> String {
    Template::parse(source).render(alert)
}

fn push_literal(tokens: &mut Vec<Token>, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(Token::Literal(prev)) = tokens.last_mut() {
        prev.push_str(text);
    } else {
        tokens.push(Token::Literal(text.to_string()));
    }
}

fn parse_expr(expr: &str) -> Option<Token> {
    let mut parts = expr.split('|').map(str::trim);
    let head = parts.next()?;
    let formatter = match parts.next() {
        Some(name) => Some(Formatter::parse(name)?),
        None => None,
    };
    if parts.next().is_some() {
        return None;
    }

    if head == "$value" {
        return Some(Token::Value(formatter));
    }
    if formatter.is_some() {
        return None;
    }

    if let Some(key) = head.strip_prefix("$labels.") {
        return (!key.is_empty()).then(|| Token::Label(key.to_string()));
    }
    if let Some(key) = head.strip_prefix("$annotations.") {
        return (!key.is_empty()).then(|| Token::Annotation(key.to_string()));
    }

    let field = match head.strip_prefix("$alert.")? {
        "name" => AlertField::Name,
        "status" => AlertField::Status,
        "severity" => AlertField::Severity,
        "fingerprint" => AlertField::Fingerprint,
        "startsAt" => AlertField::StartsAt,
        _ => return None,
    };
    Some(Token::Alert(field))
}

fn trim_float(value: f64, decimals: usize) -> String {
    let s = format!("{:.*}", decimals, value);
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s
    }
}

fn humanize(value: f64) -> String {
    const BIG: [&str; 6] = ["k", "M", "G", "T", "P", "E"];
    const SMALL: [&str; 4] = ["m", "u", "n", "p"];

    let abs = value.abs();
    if abs == 0.0 {
        return "0".to_string();
    }

    let mut scaled = value;
    let mut suffix = "";
    if abs >= 1000.0 {
        for s in BIG {
            if scaled.abs() < 1000.0 {
                break;
            }
            scaled /= 1000.0;
            suffix = s;
        }
    } else if abs < 1.0 {
        for s in SMALL {
            if scaled.abs() >= 1.0 {
                break;
            }
            scaled *= 1000.0;
            suffix = s;
        }
    }
    format!("{}{}", trim_float(scaled, 3), suffix)
}

fn humanize_bytes(value: f64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

    let mut scaled = value;
    let mut unit = UNITS[0];
    for &next in &UNITS[1..] {
        if scaled.abs() < 1024.0 {
            break;
        }
        scaled /= 1024.0;
        unit = next;
    }
    format!("{} {}", trim_float(scaled, 2), unit)
}

fn humanize_duration(seconds: f64) -> String {
    let sign = if seconds < 0.0 { "-" } else { "" };
    let abs = seconds.abs();

    if abs < 1.0 {
        return format!("{}{}ms", sign, trim_float(abs * 1000.0, 3));
    }
    if abs < 60.0 {
        return format!("{}{}s", sign, trim_float(abs, 3));
    }

    let total = abs.round() as u64;
    let parts = [
        (total / 86_400, "d"),
        (total % 86_400 / 3_600, "h"),
        (total % 3_600 / 60, "m"),
        (total % 60, "s"),
    ];
    let rendered: Vec<String> = parts
        .iter()
        .skip_while(|(n, _)| *n == 0)
        .map(|(n, unit)| format!("{n}{unit}"))
        .collect();
    format!("{}{}", sign, rendered.join(" "))
}

/// 一组通知模板（标题、正文、可选 HTML）
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationTemplate {
    subject: Template,
    body: Template,
    html: Option<Template>,
}

impl NotificationTemplate {
    pub fn new(subject: &str, body: &str) -> Self {
        Self {
            subject: Template::parse(subject),
            body: Template::parse(body),
            html: None,
        }
    }

    pub fn with_html(mut self, html: &str) -> Self {
        self.html = Some(Template::parse(html));
        self
    }

    pub fn render(&self, alert: &Alert) -> RenderedContent {
        RenderedContent {
            subject: self.subject.render(alert),
            body: self.body.render(alert),
            html: self.html.as_ref().map(|t| t.render(alert)),
        }
    }
}

/// 模板注册表，按 `(渠道类型, 动作)` 查找，未注册时回退到该动作的默认模板
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: HashMap<(ChannelType, AlertAction), NotificationTemplate>,
    firing: NotificationTemplate,
    resolved: NotificationTemplate,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            templates: HashMap::new(),
            firing: NotificationTemplate::new(
                "[{{ $alert.severity }}] {{ $alert.name }} is firing",
                "{{ $annotations.summary }}\nValue: {{ $value }}\nStarted: {{ $alert.startsAt }}\nFingerprint: {{ $alert.fingerprint }}",
            ),
            resolved: NotificationTemplate::new(
                "[resolved] {{ $alert.name }}",
                "{{ $annotations.summary }}\nLast value: {{ $value }}\nStarted: {{ $alert.startsAt }}",
            ),
        };

        registry.register(
            ChannelType::Sms,
            AlertAction::Firing,
            NotificationTemplate::new("[{{ $alert.severity }}] {{ $alert.name }}: {{ $value }}", ""),
        );
        registry.register(
            ChannelType::Email,
            AlertAction::Firing,
            NotificationTemplate::new(
                "[{{ $alert.severity }}] {{ $alert.name }} is firing",
                "{{ $annotations.summary }}\n{{ $annotations.description }}\nValue: {{ $value }}\nStarted: {{ $alert.startsAt }}",
            )
            .with_html(
                "<h2>{{ $alert.name }}</h2><p>{{ $annotations.summary }}</p>\
                 <p><b>Severity:</b> {{ $alert.severity }}<br><b>Value:</b> {{ $value }}<br>\
                 <b>Started:</b> {{ $alert.startsAt }}</p>",
            ),
        );
        registry
    }

    pub fn register(&mut self, channel_type: ChannelType, action: AlertAction, template: NotificationTemplate) {
        self.templates.insert((channel_type, action), template);
    }

    pub fn lookup(&self, channel_type: ChannelType, action: AlertAction) -> &NotificationTemplate {
        self.templates
            .get(&(channel_type, action))
            .unwrap_or(match action {
                AlertAction::Firing => &self.firing,
                AlertAction::Resolved => &self.resolved,
            })
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use flux_types::{Labels, Severity};

    fn alert(value: f64) -> Alert {
        let mut labels = Labels::new();
        labels.insert("service".to_string(), "checkout".to_string());
        let mut alert = Alert::firing(
            "r1",
            "HighErrorRate",
            Severity::Critical,
            value,
            labels,
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        );
        alert
            .annotations
            .insert("summary".to_string(), "errors are up".to_string());
        alert
    }

    #[test]
    fn test_render_placeholders() {
        let a = alert(0.08);
        let out = render(
            "{{ $alert.name }} on {{ $labels.service }}: {{ $value | humanizePercentage }} ({{$annotations.summary}})",
            &a,
        );
        assert_eq!(out, "HighErrorRate on checkout: 8% (errors are up)");

        assert_eq!(render("{{ $alert.severity }}/{{ $alert.status }}", &a), "critical/firing");
        assert_eq!(render("{{ $alert.startsAt }}", &a), "2023-11-14T22:13:20+00:00");
        assert_eq!(render("x{{ $labels.missing }}y", &a), "xy");
    }

    #[test]
    fn test_literal_fallback() {
        let a = alert(1.0);
        assert_eq!(render("{{ $value | shout }}", &a), "{{ $value | shout }}");
        assert_eq!(render("{{ .Value }} and {{ $value }}", &a), "{{ .Value }} and 1");
        assert_eq!(render("value {{ $value", &a), "value {{ $value");
        assert_eq!(render("{{ $alert.owner }}", &a), "{{ $alert.owner }}");
        assert_eq!(render("{{ $labels.service | humanize }}", &a), "{{ $labels.service | humanize }}");
        assert_eq!(render("", &a), "");
    }

    #[test]
    fn test_formatters() {
        assert_eq!(Formatter::Humanize.apply(1234.0), "1.234k");
        assert_eq!(Formatter::Humanize.apply(2_500_000.0), "2.5M");
        assert_eq!(Formatter::Humanize.apply(0.005), "5m");
        assert_eq!(Formatter::Humanize.apply(12.0), "12");
        assert_eq!(Formatter::HumanizePercentage.apply(0.1234), "12.34%");
        assert_eq!(Formatter::HumanizeBytes.apply(1536.0), "1.5 KiB");
        assert_eq!(Formatter::HumanizeBytes.apply(512.0), "512 B");
        assert_eq!(Formatter::HumanizeDuration.apply(3725.0), "1h 2m 5s");
        assert_eq!(Formatter::HumanizeDuration.apply(90_000.0), "1d 1h 0m 0s");
        assert_eq!(Formatter::HumanizeDuration.apply(0.25), "250ms");
        assert_eq!(Formatter::HumanizeDuration.apply(42.0), "42s");
    }

    #[test]
    fn test_registry_fallback() {
        let registry = TemplateRegistry::new();
        let a = alert(0.5);

        let slack = registry.lookup(ChannelType::Slack, AlertAction::Firing).render(&a);
        assert_eq!(slack.subject, "[critical] HighErrorRate is firing");
        assert!(slack.html.is_none());

        let email = registry.lookup(ChannelType::Email, AlertAction::Firing).render(&a);
        assert!(email.html.unwrap().contains("<h2>HighErrorRate</h2>"));

        let resolved = registry.lookup(ChannelType::Email, AlertAction::Resolved).render(&a);
        assert_eq!(resolved.subject, "[resolved] HighErrorRate");
    }
}

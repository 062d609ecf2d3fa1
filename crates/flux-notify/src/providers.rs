use crate::message::RenderedContent;
use crate::notifier::ChannelAdapter;
use async_trait::async_trait;
use flux_core::{FluxError, Result};
use flux_types::{ChannelConfig, ChannelType};
use std::time::Duration;
use tracing::info;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_default()
}

fn delivery(context: &str, e: impl std::fmt::Display) -> FluxError {
    FluxError::Delivery(format!("{context}: {e}"))
}

async fn post_json(
    client: &reqwest::Client,
    url: &str,
    body: &serde_json::Value,
    headers: &[(&str, String)],
    context: &str,
) -> Result<()> {
    let mut request = client.post(url).json(body);
    for (key, value) in headers {
        request = request.header(*key, value);
    }

    let response = request.send().await.map_err(|e| delivery(context, e))?;
    if response.status().is_success() {
        Ok(())
    } else {
        Err(FluxError::Delivery(format!(
            "{} failed with status: {}",
            context,
            response.status()
        )))
    }
}

// ============================================================================
// Webhook 通知
// ============================================================================

/// 向 `recipient` URL POST JSON，`settings.authorization` 作为 Authorization 头
pub struct WebhookAdapter {
    client: reqwest::Client,
}

impl WebhookAdapter {
    pub fn new() -> Self {
        Self { client: http_client() }
    }
}

impl Default for WebhookAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelAdapter for WebhookAdapter {
    async fn send(&self, channel: &ChannelConfig, content: &RenderedContent) -> Result<()> {
        let body = serde_json::to_value(content)?;
        let headers: Vec<(&str, String)> = channel
            .setting("authorization")
            .map(|auth| ("Authorization", auth.to_string()))
            .into_iter()
            .collect();

        post_json(&self.client, &channel.recipient, &body, &headers, "Webhook").await
    }

    fn channel_type(&self) -> ChannelType {
        ChannelType::Webhook
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

// ============================================================================
// Slack 通知
// ============================================================================

/// Slack incoming webhook，`recipient` 为 webhook URL
pub struct SlackAdapter {
    client: reqwest::Client,
}

impl SlackAdapter {
    pub fn new() -> Self {
        Self { client: http_client() }
    }

    fn build_message(content: &RenderedContent) -> serde_json::Value {
        serde_json::json!({
            "text": content.subject,
            "attachments": [{
                "title": content.subject,
                "text": content.body,
            }]
        })
    }
}

impl Default for SlackAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelAdapter for SlackAdapter {
    async fn send(&self, channel: &ChannelConfig, content: &RenderedContent) -> Result<()> {
        let body = Self::build_message(content);
        post_json(&self.client, &channel.recipient, &body, &[], "Slack").await
    }

    fn channel_type(&self) -> ChannelType {
        ChannelType::Slack
    }

    fn name(&self) -> &str {
        "slack"
    }
}

// ============================================================================
// 邮件通知
// ============================================================================

/// SMTP 邮件
///
/// 渠道设置：`smtp_host`、`smtp_port`（默认 587）、`username`、`password`、`from`。
pub struct EmailAdapter;

impl EmailAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for EmailAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelAdapter for EmailAdapter {
    async fn send(&self, channel: &ChannelConfig, content: &RenderedContent) -> Result<()> {
        use lettre::message::{header::ContentType, MultiPart, SinglePart};
        use lettre::transport::smtp::authentication::Credentials;
        use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

        let host = channel
            .setting("smtp_host")
            .ok_or_else(|| FluxError::Config(format!("channel {} has no smtp_host", channel.id)))?;
        let port = match channel.setting("smtp_port") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|e| FluxError::Config(format!("invalid smtp_port for {}: {e}", channel.id)))?,
            None => 587,
        };
        let from = channel.setting("from").unwrap_or("flux-monitor@localhost");

        let builder = Message::builder()
            .from(from.parse().map_err(|e| delivery("Email from address", e))?)
            .to(channel.recipient.parse().map_err(|e| delivery("Email recipient", e))?)
            .subject(&content.subject);

        let email = match &content.html {
            Some(html) => builder.multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(content.body.clone()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html.clone()),
                    ),
            ),
            None => builder
                .header(ContentType::TEXT_PLAIN)
                .body(content.body.clone()),
        }
        .map_err(|e| delivery("Email build", e))?;

        let mut transport = AsyncSmtpTransport::<Tokio1Executor>::relay(host)
            .map_err(|e| delivery("SMTP relay", e))?
            .port(port);
        if let (Some(user), Some(pass)) = (channel.setting("username"), channel.setting("password")) {
            transport = transport.credentials(Credentials::new(user.to_string(), pass.to_string()));
        }

        transport
            .build()
            .send(email)
            .await
            .map_err(|e| delivery("Email send", e))?;
        Ok(())
    }

    fn channel_type(&self) -> ChannelType {
        ChannelType::Email
    }

    fn name(&self) -> &str {
        "email"
    }
}

// ============================================================================
// 短信通知
// ============================================================================

/// HTTP 短信网关，渠道设置 `gateway_url` 与可选的 `api_key`，`recipient` 为手机号
pub struct SmsAdapter {
    client: reqwest::Client,
}

impl SmsAdapter {
    pub fn new() -> Self {
        Self { client: http_client() }
    }
}

impl Default for SmsAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelAdapter for SmsAdapter {
    async fn send(&self, channel: &ChannelConfig, content: &RenderedContent) -> Result<()> {
        let gateway = channel
            .setting("gateway_url")
            .ok_or_else(|| FluxError::Config(format!("channel {} has no gateway_url", channel.id)))?;

        let payload = serde_json::json!({
            "to": channel.recipient,
            "message": content.text(),
        });
        let headers: Vec<(&str, String)> = channel
            .setting("api_key")
            .map(|key| ("Authorization", format!("Bearer {key}")))
            .into_iter()
            .collect();

        post_json(&self.client, gateway, &payload, &headers, "SMS gateway").await
    }

    fn channel_type(&self) -> ChannelType {
        ChannelType::Sms
    }

    fn name(&self) -> &str {
        "sms"
    }
}

// ============================================================================
// 日志通知
// ============================================================================

/// 只写日志，用于本地调试
pub struct LogAdapter;

#[async_trait]
impl ChannelAdapter for LogAdapter {
    async fn send(&self, channel: &ChannelConfig, content: &RenderedContent) -> Result<()> {
        info!(
            channel = %channel.id,
            recipient = %channel.recipient,
            subject = %content.subject,
            body = %content.body,
            "Notification"
        );
        Ok(())
    }

    fn channel_type(&self) -> ChannelType {
        ChannelType::Log
    }

    fn name(&self) -> &str {
        "log"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slack_message_shape() {
        let content = RenderedContent::new("[critical] HighErrorRate is firing", "errors are up");
        let body = SlackAdapter::build_message(&content);
        assert_eq!(body["text"], "[critical] HighErrorRate is firing");
        assert_eq!(body["attachments"][0]["text"], "errors are up");
    }

    #[tokio::test]
    async fn test_misconfigured_channels_fail() {
        let content = RenderedContent::new("s", "b");

        let sms = ChannelConfig::new("pager", ChannelType::Sms, "+15550100");
        let err = SmsAdapter::new().send(&sms, &content).await.unwrap_err();
        assert_eq!(err.kind(), "config");

        let email = ChannelConfig::new("mail", ChannelType::Email, "ops@example.com");
        let err = EmailAdapter::new().send(&email, &content).await.unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[tokio::test]
    async fn test_log_adapter_always_succeeds() {
        let channel = ChannelConfig::new("debug", ChannelType::Log, "stdout");
        assert!(LogAdapter.send(&channel, &RenderedContent::new("s", "b")).await.is_ok());
    }
}

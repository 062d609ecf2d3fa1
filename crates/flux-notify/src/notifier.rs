use crate::message::RenderedContent;
use async_trait::async_trait;
use flux_core::Result;
use flux_types::{ChannelConfig, ChannelType};

/// 渠道适配器
///
/// 失败时返回 `FluxError::Delivery`，由通知管理器负责重试。
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// 发送通知
    async fn send(&self, channel: &ChannelConfig, content: &RenderedContent) -> Result<()>;

    /// 适配器处理的渠道类型
    fn channel_type(&self) -> ChannelType;

    fn name(&self) -> &str;
}

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};

/// 关闭信号类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM
    Term,

    /// SIGINT / Ctrl+C
    Interrupt,

    /// 手动触发
    Manual,
}

/// 信号处理器
///
/// 系统信号与手动触发都会广播给所有订阅者，HTTP 服务用它做优雅退出。
#[derive(Clone)]
pub struct SignalHandler {
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
}

impl SignalHandler {
    pub fn new() -> (Self, broadcast::Receiver<ShutdownSignal>) {
        let (tx, rx) = broadcast::channel(16);
        (Self { shutdown_tx: tx }, rx)
    }

    /// 等待系统信号或手动触发，先到者生效
    pub async fn wait_for_shutdown(&self) -> ShutdownSignal {
        let mut rx = self.shutdown_tx.subscribe();
        tokio::select! {
            received = rx.recv() => received.unwrap_or(ShutdownSignal::Manual),
            signal = Self::system_signal() => {
                let _ = self.shutdown_tx.send(signal);
                signal
            }
        }
    }

    #[cfg(unix)]
    async fn system_signal() -> ShutdownSignal {
        use signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "Failed to install signal handlers, falling back to Ctrl+C");
                return Self::ctrl_c().await;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                ShutdownSignal::Term
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
                ShutdownSignal::Interrupt
            }
        }
    }

    #[cfg(not(unix))]
    async fn system_signal() -> ShutdownSignal {
        Self::ctrl_c().await
    }

    async fn ctrl_c() -> ShutdownSignal {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            // 无法监听时只响应手动触发
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C");
        ShutdownSignal::Interrupt
    }

    /// 手动触发关闭
    pub fn trigger_shutdown(&self) {
        info!("Manual shutdown triggered");
        let _ = self.shutdown_tx.send(ShutdownSignal::Manual);
    }

    /// 订阅关闭信号
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new().0
    }
}

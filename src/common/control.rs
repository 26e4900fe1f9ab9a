use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// 暂停信号的控制端，可以反复暂停和恢复
#[derive(Debug, Clone)]
pub struct PauseTokenSource {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for PauseTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseTokenSource {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn pause(&self) {
        self.tx.send_replace(true);
    }

    pub fn resume(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn token(&self) -> PauseToken {
        PauseToken {
            rx: self.tx.subscribe(),
        }
    }
}

/// 暂停信号的观察端
#[derive(Debug, Clone)]
pub struct PauseToken {
    rx: watch::Receiver<bool>,
}

impl PauseToken {
    pub fn is_paused(&self) -> bool {
        *self.rx.borrow()
    }

    /// 暂停期间挂起，恢复后返回 true；等待中被取消则返回 false。
    ///
    /// 控制端全部被丢弃后不会再有人恢复，同样返回 false。
    pub async fn wait_while_paused(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.rx.clone();
        let resumed = async move { rx.wait_for(|paused| !*paused).await.map(|_| ()) };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            resumed = resumed => resumed.is_ok(),
        }
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::common::control::{PauseToken, PauseTokenSource};

/// 抓取协调方提供给下载器的停止命令
pub trait CrawlerService: Send + Sync {
    /// 停止当前抓取，重复调用无副作用
    fn stop_crawl(&self);
}

/// 面向操作者的错误展示
pub trait ShellService: Send + Sync {
    fn show_error(&self, error: &(dyn std::error::Error + Send + Sync), message: &str);
}

/// 单个抓取目标的协调者，持有取消信号和暂停信号
pub struct CrawlManager {
    cancel: ArcSwap<CancellationToken>,
    pause: PauseTokenSource,
    stopped: AtomicBool,
}

impl Default for CrawlManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CrawlManager {
    pub fn new() -> Self {
        Self {
            cancel: ArcSwap::from_pointee(CancellationToken::new()),
            pause: PauseTokenSource::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.load().as_ref().clone()
    }

    pub fn pause_token(&self) -> PauseToken {
        self.pause.token()
    }

    pub fn pause(&self) {
        info!("暂停抓取");
        self.pause.pause();
    }

    pub fn resume(&self) {
        info!("恢复抓取");
        self.pause.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// 为下一轮抓取换一个新的取消信号，暂停状态保持不变
    pub fn restart(&self) -> CancellationToken {
        let token = CancellationToken::new();
        self.cancel.store(Arc::new(token.clone()));
        self.stopped.store(false, Ordering::Release);
        info!("已重置取消信号");
        token
    }
}

impl CrawlerService for CrawlManager {
    fn stop_crawl(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            debug!("抓取已经停止，忽略重复的停止命令");
            return;
        }
        info!("🛑 停止抓取");
        self.cancel.load().cancel();
    }
}

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use arc_swap::ArcSwap;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::DownloadError;
use super::manager::{CrawlerService, ShellService};
use super::models::{CrawlItem, DownloadStats, file_location};
use super::writer::{AppendTicket, DiskWriter};
use crate::common::control::PauseToken;
use crate::common::queue::PostQueue;

pub const DISK_FULL_MESSAGE: &str = "磁盘空间不足，已停止当前抓取";

#[derive(Debug, Default)]
struct StatsCounter {
    dispatched: AtomicUsize,
    persisted: AtomicUsize,
    failed: AtomicUsize,
    storage_exhausted: AtomicUsize,
}

impl StatsCounter {
    fn snapshot(&self) -> DownloadStats {
        DownloadStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            storage_exhausted: self.storage_exhausted.load(Ordering::Relaxed),
        }
    }
}

// 写盘任务需要的共享状态
#[derive(Clone)]
struct PersistContext {
    writer: Arc<DiskWriter>,
    crawler: Arc<dyn CrawlerService>,
    shell: Arc<dyn ShellService>,
    write_slots: Option<Arc<Semaphore>>,
    stats: Arc<StatsCounter>,
    disk_full_reported: Arc<AtomicBool>,
}

/// 从队列取出内容并写入下载目录
///
/// 每取出一条内容就派发一个写盘任务，不等待其完成；队列耗尽或收到取消后，
/// 等待所有已派发的任务结束才返回。多个下载器可以消费同一个队列。
pub struct PostDownloader {
    download_location: PathBuf,
    queue: PostQueue<CrawlItem>,
    writer: Arc<DiskWriter>,
    crawler: Arc<dyn CrawlerService>,
    shell: Arc<dyn ShellService>,
    pause: PauseToken,
    cancel: ArcSwap<CancellationToken>,
    max_concurrent_writes: Option<usize>,
    disk_full_reported: Arc<AtomicBool>,
}

impl PostDownloader {
    pub fn new(
        download_location: impl Into<PathBuf>,
        queue: PostQueue<CrawlItem>,
        crawler: Arc<dyn CrawlerService>,
        shell: Arc<dyn ShellService>,
        pause: PauseToken,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            download_location: download_location.into(),
            queue,
            writer: Arc::new(DiskWriter::default()),
            crawler,
            shell,
            pause,
            cancel: ArcSwap::from_pointee(cancel),
            max_concurrent_writes: None,
            disk_full_reported: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 多个下载器共用同一个写入器时，同一文件的写入顺序在下载器之间同样保持
    pub fn with_writer(mut self, writer: Arc<DiskWriter>) -> Self {
        self.writer = writer;
        self
    }

    pub fn with_max_concurrent_writes(mut self, limit: Option<usize>) -> Self {
        self.max_concurrent_writes = limit.map(|l| l.max(1));
        self
    }

    pub fn download_location(&self) -> &Path {
        &self.download_location
    }

    /// 共用提示标记的下载器之间，磁盘已满只提示一次
    pub fn with_disk_full_flag(mut self, reported: Arc<AtomicBool>) -> Self {
        self.disk_full_reported = reported;
        self
    }

    /// 替换取消信号，下一次循环开始生效，同时开始新一轮抓取的磁盘已满提示
    pub fn change_cancellation_token(&self, cancel: CancellationToken) {
        self.cancel.store(Arc::new(cancel));
        self.disk_full_reported.store(false, Ordering::Release);
    }

    fn current_cancel(&self) -> CancellationToken {
        self.cancel.load().as_ref().clone()
    }

    pub async fn download_crawler_data(&self) -> Result<DownloadStats, DownloadError> {
        tokio::fs::create_dir_all(&self.download_location).await?;
        info!("开始写入下载目录: {}", self.download_location.display());

        let context = PersistContext {
            writer: Arc::clone(&self.writer),
            crawler: Arc::clone(&self.crawler),
            shell: Arc::clone(&self.shell),
            write_slots: self
                .max_concurrent_writes
                .map(|limit| Arc::new(Semaphore::new(limit))),
            stats: Arc::new(StatsCounter::default()),
            disk_full_reported: Arc::clone(&self.disk_full_reported),
        };
        let mut tracked_tasks = JoinSet::new();

        loop {
            let cancel = self.current_cancel();

            match self.queue.output_available(&cancel).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("队列已取完");
                    break;
                }
                Err(e) => {
                    debug!("停止等待队列: {}", e);
                    break;
                }
            }

            if cancel.is_cancelled() {
                debug!("收到取消信号，不再取出新内容");
                break;
            }

            if self.pause.is_paused() {
                info!("⏸️ 下载已暂停");
                if !self.pause.wait_while_paused(&cancel).await || cancel.is_cancelled() {
                    debug!("暂停期间收到取消信号");
                    break;
                }
                info!("▶️ 下载已恢复");
            }

            // 其他下载器可能先一步取走了内容
            let Some(item) = self.queue.try_receive() else {
                continue;
            };

            self.dispatch(&mut tracked_tasks, item, &context);
        }

        let in_flight = tracked_tasks.len();
        if in_flight > 0 {
            debug!("等待 {} 个写盘任务结束", in_flight);
        }
        while let Some(joined) = tracked_tasks.join_next().await {
            if let Err(e) = joined {
                error!("写盘任务异常退出: {}", e);
            }
        }

        let stats = context.stats.snapshot();
        info!(
            "下载器结束: 派发 {}, 成功 {}, 失败 {}, 磁盘已满 {}",
            stats.dispatched, stats.persisted, stats.failed, stats.storage_exhausted
        );
        Ok(stats)
    }

    fn dispatch(&self, tracked_tasks: &mut JoinSet<()>, item: CrawlItem, context: &PersistContext) {
        context.stats.dispatched.fetch_add(1, Ordering::Relaxed);

        let path = match file_location(&self.download_location, &item.filename) {
            Ok(path) => path,
            Err(e) => {
                warn!("跳过内容: {}", e);
                context.stats.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        // 凭证必须在派发时领取，保证同一文件按入队顺序写入
        let ticket = context.writer.reserve(path);
        let context = context.clone();
        tracked_tasks.spawn(async move {
            download_item(context, ticket, item).await;
        });
    }
}

async fn download_item(context: PersistContext, mut ticket: AppendTicket, item: CrawlItem) {
    // 先排到自己的顺序再占用并发名额，避免持有名额等待前一个写入
    ticket.wait_turn().await;
    let _permit = match &context.write_slots {
        Some(slots) => Arc::clone(slots).acquire_owned().await.ok(),
        None => None,
    };

    let path = ticket.path().to_path_buf();
    match context.writer.persist(ticket, &item.content).await {
        Ok(()) => {
            context.stats.persisted.fetch_add(1, Ordering::Relaxed);
            debug!("已写入: {}", path.display());
        }
        Err(e) if e.is_storage_exhausted() => {
            context
                .stats
                .storage_exhausted
                .fetch_add(1, Ordering::Relaxed);
            error!("写入 {} 失败，磁盘空间不足: {}", path.display(), e);
            // 同一轮抓取只提示一次
            if !context.disk_full_reported.swap(true, Ordering::AcqRel) {
                context.shell.show_error(&e, DISK_FULL_MESSAGE);
            }
            context.crawler.stop_crawl();
        }
        Err(e) => {
            context.stats.failed.fetch_add(1, Ordering::Relaxed);
            warn!("写入 {} 失败，已跳过: {}", path.display(), e);
        }
    }
}

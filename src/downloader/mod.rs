use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::common::models::CrawlSettings;
use crate::common::queue::PostQueue;
use error::DownloadError;
use manager::{CrawlManager, CrawlerService, ShellService};
use models::{CrawlItem, DownloadStats};
use worker::PostDownloader;
use writer::DiskWriter;

pub mod error;
pub mod manager;
pub mod models;
pub mod worker;
pub mod writer;

/// 同一个抓取目标的一组下载器，共享队列和写入器
pub struct BlogDownloader {
    workers: Vec<Arc<PostDownloader>>,
    crawler: Arc<dyn CrawlerService>,
}

impl BlogDownloader {
    pub fn new(
        settings: &CrawlSettings,
        queue: PostQueue<CrawlItem>,
        manager: Arc<CrawlManager>,
        shell: Arc<dyn ShellService>,
    ) -> Self {
        let writer = Arc::new(DiskWriter::default());
        let disk_full_reported = Arc::new(AtomicBool::new(false));
        let crawler: Arc<dyn CrawlerService> = manager.clone();

        let workers = (0..settings.workers.max(1))
            .map(|_| {
                let worker = PostDownloader::new(
                    settings.download_location.clone(),
                    queue.clone(),
                    Arc::clone(&crawler),
                    Arc::clone(&shell),
                    manager.pause_token(),
                    manager.cancellation_token(),
                )
                .with_writer(Arc::clone(&writer))
                .with_disk_full_flag(Arc::clone(&disk_full_reported))
                .with_max_concurrent_writes(settings.max_concurrent_writes);
                Arc::new(worker)
            })
            .collect();

        Self { workers, crawler }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn change_cancellation_token(&self, cancel: CancellationToken) {
        for worker in &self.workers {
            worker.change_cancellation_token(cancel.clone());
        }
    }

    /// 运行所有下载器直到队列取完或抓取被停止，返回合并后的统计
    ///
    /// 任一下载器失败都会停止抓取，生产者不会再等待无人消费的队列。
    pub async fn download(&self) -> Result<DownloadStats, DownloadError> {
        let handles: Vec<_> = self
            .workers
            .iter()
            .map(|worker| {
                let worker = Arc::clone(worker);
                let crawler = Arc::clone(&self.crawler);
                tokio::spawn(async move {
                    let result = worker.download_crawler_data().await;
                    if let Err(e) = &result {
                        error!("下载器失败: {}", e);
                        crawler.stop_crawl();
                    }
                    result
                })
            })
            .collect();

        let mut total = DownloadStats::default();
        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(stats)) => total.merge(&stats),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!("下载器异常退出: {}", e);
                    self.crawler.stop_crawl();
                }
            }
        }

        match first_error {
            Some(e) if total.dispatched == 0 => Err(e),
            _ => Ok(total),
        }
    }
}

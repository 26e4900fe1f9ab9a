use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::Shared;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tracing::debug;

use super::error::DownloadError;
use super::models::CrawlContent;

/// 底层的追加写入，测试中可以替换
#[async_trait]
pub trait FileAppender: Send + Sync {
    async fn append(&self, path: &Path, data: &[u8]) -> io::Result<()>;
}

/// 以追加模式写入本地文件，不存在时创建
#[derive(Debug, Default, Clone, Copy)]
pub struct FsAppender;

#[async_trait]
impl FileAppender for FsAppender {
    async fn append(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(data).await?;
        file.flush().await
    }
}

type TurnSignal = Shared<oneshot::Receiver<()>>;
type Tails = DashMap<PathBuf, (u64, TurnSignal)>;

/// 同一文件的写入顺序凭证
///
/// 在派发时同步领取，写入按领取顺序进行；凭证被丢弃即视为本次写入结束。
pub struct AppendTicket {
    path: PathBuf,
    ticket: u64,
    previous: Option<TurnSignal>,
    _done: oneshot::Sender<()>,
    tails: Arc<Tails>,
}

impl AppendTicket {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 等待同一文件上更早的写入结束
    pub async fn wait_turn(&mut self) {
        if let Some(previous) = self.previous.take() {
            // 前一个写入无论成功、失败还是被丢弃都会结束等待
            let _ = previous.await;
        }
    }
}

impl Drop for AppendTicket {
    fn drop(&mut self) {
        self.tails
            .remove_if(&self.path, |_, (ticket, _)| *ticket == self.ticket);
    }
}

/// 序列化内容并追加到目标文件
///
/// 不同文件之间互不等待，同一文件的写入按 `reserve` 的调用顺序串行。
pub struct DiskWriter {
    appender: Arc<dyn FileAppender>,
    tails: Arc<Tails>,
    next_ticket: AtomicU64,
}

impl Default for DiskWriter {
    fn default() -> Self {
        Self::new(Arc::new(FsAppender))
    }
}

impl DiskWriter {
    pub fn new(appender: Arc<dyn FileAppender>) -> Self {
        Self {
            appender,
            tails: Arc::new(DashMap::new()),
            next_ticket: AtomicU64::new(0),
        }
    }

    pub fn reserve(&self, path: PathBuf) -> AppendTicket {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (done, turn) = oneshot::channel();
        let previous = self
            .tails
            .insert(path.clone(), (ticket, turn.shared()))
            .map(|(_, previous)| previous);

        AppendTicket {
            path,
            ticket,
            previous,
            _done: done,
            tails: Arc::clone(&self.tails),
        }
    }

    pub async fn append(&self, mut ticket: AppendTicket, data: &[u8]) -> io::Result<()> {
        ticket.wait_turn().await;
        debug!("追加写入 {} 字节到 {}", data.len(), ticket.path().display());
        self.appender.append(ticket.path(), data).await
    }

    pub async fn persist(
        &self,
        ticket: AppendTicket,
        content: &CrawlContent,
    ) -> Result<(), DownloadError> {
        let data = content.serialize()?;
        self.append(ticket, &data).await?;
        Ok(())
    }

    /// 当前仍有写入在排队的文件数
    pub fn pending_files(&self) -> usize {
        self.tails.len()
    }
}

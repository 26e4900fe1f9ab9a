use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use blog_downloader::common::control::PauseTokenSource;
use blog_downloader::downloader::BlogDownloader;
use blog_downloader::downloader::manager::{CrawlManager, CrawlerService, ShellService};
use blog_downloader::downloader::worker::{DISK_FULL_MESSAGE, PostDownloader};
use blog_downloader::downloader::writer::{DiskWriter, FileAppender, FsAppender};
use blog_downloader::{CrawlContent, CrawlItem, CrawlSettings, PostQueue};
use serde_json::json;
use tokio_util::sync::CancellationToken;

// 记录停止命令次数，并像真实协调者一样取消抓取
struct CountingCrawler {
    stops: AtomicUsize,
    cancel: CancellationToken,
}

impl CountingCrawler {
    fn new(cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            stops: AtomicUsize::new(0),
            cancel,
        })
    }

    fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl CrawlerService for CountingCrawler {
    fn stop_crawl(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

#[derive(Default)]
struct RecordingShell {
    messages: Mutex<Vec<String>>,
}

impl ShellService for RecordingShell {
    fn show_error(&self, error: &(dyn std::error::Error + Send + Sync), message: &str) {
        self.messages
            .lock()
            .unwrap()
            .push(format!("{}: {}", message, error));
    }
}

// 可注入失败和延迟的写入
#[derive(Default)]
struct ScriptedAppender {
    calls: AtomicUsize,
    completed: AtomicUsize,
    delay: Duration,
    fail_first_with_full_disk: bool,
    always_full: bool,
    locked_file: Option<&'static str>,
    written: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl FileAppender for ScriptedAppender {
    async fn append(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.always_full || (self.fail_first_with_full_disk && call == 0) {
            return Err(io::Error::from(io::ErrorKind::StorageFull));
        }
        if let Some(locked) = self.locked_file {
            if path.file_name().is_some_and(|name| name == locked) {
                return Err(io::Error::from(io::ErrorKind::PermissionDenied));
            }
        }
        FsAppender.append(path, data).await?;
        self.written.lock().unwrap().push(path.to_path_buf());
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    dir: tempfile::TempDir,
    queue: PostQueue<CrawlItem>,
    cancel: CancellationToken,
    pause: PauseTokenSource,
    crawler: Arc<CountingCrawler>,
    shell: Arc<RecordingShell>,
}

impl Harness {
    fn new() -> Self {
        let cancel = CancellationToken::new();
        Self {
            dir: tempfile::tempdir().unwrap(),
            queue: PostQueue::bounded(16),
            crawler: CountingCrawler::new(cancel.clone()),
            cancel,
            pause: PauseTokenSource::new(),
            shell: Arc::new(RecordingShell::default()),
        }
    }

    fn download_dir(&self) -> PathBuf {
        self.dir.path().join("blog")
    }

    fn worker(&self, appender: Option<Arc<ScriptedAppender>>) -> Arc<PostDownloader> {
        let mut worker = PostDownloader::new(
            self.download_dir(),
            self.queue.clone(),
            self.crawler.clone(),
            self.shell.clone(),
            self.pause.token(),
            self.cancel.clone(),
        );
        if let Some(appender) = appender {
            worker = worker.with_writer(Arc::new(DiskWriter::new(appender)));
        }
        Arc::new(worker)
    }

    fn read(&self, filename: &str) -> String {
        std::fs::read_to_string(self.download_dir().join(filename)).unwrap()
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("等待条件超时");
}

#[tokio::test]
async fn test_drain_processes_every_item_once() {
    let harness = Harness::new();
    let worker = harness.worker(None);
    let running = tokio::spawn({
        let worker = Arc::clone(&worker);
        async move { worker.download_crawler_data().await }
    });

    for i in 0..40 {
        harness
            .queue
            .enqueue(CrawlItem::text(format!("post-{i}.txt"), format!("body {i}")))
            .await
            .unwrap();
    }
    harness.queue.complete_adding();

    let stats = running.await.unwrap().unwrap();
    assert_eq!(stats.dispatched, 40);
    assert_eq!(stats.persisted, 40);
    assert_eq!(stats.failed, 0);
    for i in 0..40 {
        assert_eq!(harness.read(&format!("post-{i}.txt")), format!("body {i}"));
    }
}

#[tokio::test]
async fn test_cancel_before_any_item_dispatches_nothing() {
    let harness = Harness::new();
    harness.cancel.cancel();

    let stats = tokio::time::timeout(
        Duration::from_secs(1),
        harness.worker(None).download_crawler_data(),
    )
    .await
    .expect("取消后应当及时结束")
    .unwrap();

    assert_eq!(stats.dispatched, 0);
    // 下载目录仍然会被创建
    assert!(harness.download_dir().is_dir());
}

#[tokio::test]
async fn test_cancel_after_dequeue_joins_in_flight_writes() {
    let harness = Harness::new();
    let appender = Arc::new(ScriptedAppender {
        delay: Duration::from_millis(100),
        ..Default::default()
    });
    let worker = harness.worker(Some(appender.clone()));
    let running = tokio::spawn({
        let worker = Arc::clone(&worker);
        async move { worker.download_crawler_data().await }
    });

    for i in 0..3 {
        harness
            .queue
            .enqueue(CrawlItem::text(format!("early-{i}.txt"), "x"))
            .await
            .unwrap();
    }
    wait_until(|| harness.queue.is_empty()).await;

    harness.cancel.cancel();
    for i in 0..2 {
        harness
            .queue
            .enqueue(CrawlItem::text(format!("late-{i}.txt"), "y"))
            .await
            .unwrap();
    }

    let stats = running.await.unwrap().unwrap();
    assert_eq!(stats.dispatched, 3);
    assert_eq!(stats.persisted, 3);
    assert_eq!(appender.completed.load(Ordering::SeqCst), 3);
    assert_eq!(harness.queue.len(), 2);
    assert!(!harness.download_dir().join("late-0.txt").exists());
}

#[tokio::test]
async fn test_pause_withholds_items_without_losing_them() {
    let harness = Harness::new();
    harness.pause.pause();
    let worker = harness.worker(None);
    let running = tokio::spawn({
        let worker = Arc::clone(&worker);
        async move { worker.download_crawler_data().await }
    });

    harness
        .queue
        .enqueue(CrawlItem::text("paused.txt", "during pause"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.queue.len(), 1);
    assert!(!harness.download_dir().join("paused.txt").exists());

    harness.pause.resume();
    harness.queue.complete_adding();

    let stats = running.await.unwrap().unwrap();
    assert_eq!(stats.persisted, 1);
    assert_eq!(harness.read("paused.txt"), "during pause");
}

#[tokio::test]
async fn test_cancel_while_paused_shuts_worker_down() {
    let harness = Harness::new();
    harness.pause.pause();
    let worker = harness.worker(None);
    let running = tokio::spawn({
        let worker = Arc::clone(&worker);
        async move { worker.download_crawler_data().await }
    });

    harness
        .queue
        .enqueue(CrawlItem::text("never.txt", "x"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    harness.cancel.cancel();

    let stats = tokio::time::timeout(Duration::from_secs(1), running)
        .await
        .expect("暂停中的下载器应当响应取消")
        .unwrap()
        .unwrap();
    assert_eq!(stats.dispatched, 0);
    assert_eq!(harness.queue.len(), 1);
}

#[tokio::test]
async fn test_same_file_documents_append_in_enqueue_order() {
    let harness = Harness::new();
    let first = json!({"id": 1, "title": "first"});
    let second = json!({"id": 2, "title": "second"});

    harness
        .queue
        .enqueue(CrawlItem::document("a.xml", first.clone()))
        .await
        .unwrap();
    harness
        .queue
        .enqueue(CrawlItem::document("a.xml", second.clone()))
        .await
        .unwrap();
    harness.queue.complete_adding();

    harness.worker(None).download_crawler_data().await.unwrap();

    let expected = [
        CrawlContent::Document(first).serialize().unwrap(),
        CrawlContent::Document(second).serialize().unwrap(),
    ]
    .concat();
    assert_eq!(harness.read("a.xml").into_bytes(), expected);
}

#[tokio::test]
async fn test_storage_exhaustion_stops_crawl_once() {
    let harness = Harness::new();
    let appender = Arc::new(ScriptedAppender {
        fail_first_with_full_disk: true,
        ..Default::default()
    });
    let worker = harness.worker(Some(appender.clone()));
    let running = tokio::spawn({
        let worker = Arc::clone(&worker);
        async move { worker.download_crawler_data().await }
    });

    harness
        .queue
        .enqueue(CrawlItem::text("first.txt", "x"))
        .await
        .unwrap();
    wait_until(|| harness.crawler.stops() > 0).await;

    for i in 0..3 {
        harness
            .queue
            .enqueue(CrawlItem::text(format!("after-{i}.txt"), "y"))
            .await
            .unwrap();
    }
    harness.queue.complete_adding();

    let stats = running.await.unwrap().unwrap();
    assert_eq!(harness.crawler.stops(), 1);
    assert_eq!(stats.storage_exhausted, 1);
    assert_eq!(stats.dispatched, 1);
    assert_eq!(appender.calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.queue.len(), 3);

    let messages = harness.shell.messages.lock().unwrap();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].starts_with(DISK_FULL_MESSAGE));
}

#[tokio::test]
async fn test_single_item_failure_does_not_stop_drain() {
    let harness = Harness::new();
    let appender = Arc::new(ScriptedAppender {
        locked_file: Some("locked.txt"),
        ..Default::default()
    });
    let worker = harness.worker(Some(appender.clone()));

    for name in ["one.txt", "locked.txt", "two.txt", "three.txt"] {
        harness
            .queue
            .enqueue(CrawlItem::text(name, name))
            .await
            .unwrap();
    }
    // 跳出下载目录的文件名同样只影响这一条
    harness
        .queue
        .enqueue(CrawlItem::text("../escape.txt", "nope"))
        .await
        .unwrap();
    harness.queue.complete_adding();

    let stats = worker.download_crawler_data().await.unwrap();
    assert_eq!(stats.dispatched, 5);
    assert_eq!(stats.persisted, 3);
    assert_eq!(stats.failed, 2);
    assert_eq!(harness.crawler.stops(), 0);
    assert!(harness.shell.messages.lock().unwrap().is_empty());
    assert_eq!(harness.read("three.txt"), "three.txt");
}

#[tokio::test]
async fn test_swapped_cancellation_token_is_used() {
    let harness = Harness::new();
    let worker = harness.worker(None);
    let replacement = CancellationToken::new();
    worker.change_cancellation_token(replacement.clone());

    // 旧的信号不再影响下载器
    harness.cancel.cancel();
    harness
        .queue
        .enqueue(CrawlItem::text("kept.txt", "kept"))
        .await
        .unwrap();
    harness.queue.complete_adding();

    let stats = worker.download_crawler_data().await.unwrap();
    assert_eq!(stats.persisted, 1);
    assert!(!replacement.is_cancelled());
}

#[tokio::test]
async fn test_limited_concurrent_writes_still_drains_same_file() {
    let harness = Harness::new();
    let worker = PostDownloader::new(
        harness.download_dir(),
        harness.queue.clone(),
        harness.crawler.clone(),
        harness.shell.clone(),
        harness.pause.token(),
        harness.cancel.clone(),
    )
    .with_max_concurrent_writes(Some(1));

    for i in 0..10 {
        harness
            .queue
            .enqueue(CrawlItem::text("shared.txt", format!("{i}\n")))
            .await
            .unwrap();
    }
    harness.queue.complete_adding();

    let stats = tokio::time::timeout(Duration::from_secs(5), worker.download_crawler_data())
        .await
        .expect("并发受限时不应死锁")
        .unwrap();
    assert_eq!(stats.persisted, 10);
    let expected: String = (0..10).map(|i| format!("{i}\n")).collect();
    assert_eq!(harness.read("shared.txt"), expected);
}

#[tokio::test]
async fn test_several_workers_share_one_queue() {
    let dir = tempfile::tempdir().unwrap();
    let settings = CrawlSettings {
        download_location: dir.path().to_path_buf(),
        workers: 3,
        queue_capacity: Some(4),
        ..Default::default()
    };
    let queue = PostQueue::with_capacity(settings.queue_capacity);
    let manager = Arc::new(CrawlManager::new());
    let downloader = BlogDownloader::new(
        &settings,
        queue.clone(),
        Arc::clone(&manager),
        Arc::new(RecordingShell::default()),
    );
    assert_eq!(downloader.worker_count(), 3);

    let running = tokio::spawn(async move { downloader.download().await });
    for i in 0..50 {
        queue
            .enqueue(CrawlItem::text(format!("bucket-{}.txt", i % 5), format!("line-{i}\n")))
            .await
            .unwrap();
    }
    queue.complete_adding();

    let stats = running.await.unwrap().unwrap();
    assert_eq!(stats.dispatched, 50);
    assert_eq!(stats.persisted, 50);

    let mut lines = Vec::new();
    for bucket in 0..5 {
        let content = std::fs::read_to_string(dir.path().join(format!("bucket-{bucket}.txt"))).unwrap();
        lines.extend(content.lines().map(str::to_string));
    }
    lines.sort();
    let mut expected: Vec<String> = (0..50).map(|i| format!("line-{i}")).collect();
    expected.sort();
    assert_eq!(lines, expected);
}

#[tokio::test]
async fn test_failed_workers_release_blocked_producer() {
    let dir = tempfile::tempdir().unwrap();
    // 下载目录的上级是普通文件，目录无法创建
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"").unwrap();

    let settings = CrawlSettings {
        download_location: blocker.join("blog"),
        workers: 2,
        queue_capacity: Some(1),
        ..Default::default()
    };
    let queue = PostQueue::with_capacity(settings.queue_capacity);
    let manager = Arc::new(CrawlManager::new());
    let downloader = BlogDownloader::new(
        &settings,
        queue.clone(),
        Arc::clone(&manager),
        Arc::new(RecordingShell::default()),
    );

    queue
        .enqueue(CrawlItem::text("first.txt", "x"))
        .await
        .unwrap();
    let running = tokio::spawn(async move { downloader.download().await });

    // 队列已满，只有抓取被停止时生产者才能脱身
    let cancel = manager.cancellation_token();
    let released = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::select! {
            result = queue.enqueue(CrawlItem::text("second.txt", "y")) => result.is_ok(),
            _ = cancel.cancelled() => false,
        }
    })
    .await
    .expect("生产者不应一直阻塞");

    assert!(!released);
    assert!(manager.is_stopped());
    assert!(running.await.unwrap().is_err());
    assert_eq!(queue.len(), 1);
}

#[tokio::test]
async fn test_disk_full_message_shown_once_for_concurrent_failures() {
    let harness = Harness::new();
    let appender = Arc::new(ScriptedAppender {
        always_full: true,
        delay: Duration::from_millis(50),
        ..Default::default()
    });

    for i in 0..4 {
        harness
            .queue
            .enqueue(CrawlItem::text(format!("full-{i}.txt"), "x"))
            .await
            .unwrap();
    }
    let stats = harness
        .worker(Some(appender.clone()))
        .download_crawler_data()
        .await
        .unwrap();

    assert_eq!(stats.dispatched, 4);
    assert_eq!(stats.storage_exhausted, 4);
    assert_eq!(harness.shell.messages.lock().unwrap().len(), 1);
    assert!(harness.cancel.is_cancelled());
}

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use regex::Regex;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, info, warn};

use blog_downloader::common::logger::{ConsoleShell, PrettyLogger};
use blog_downloader::downloader::BlogDownloader;
use blog_downloader::downloader::manager::{CrawlManager, CrawlerService};
use blog_downloader::{
    CrawlContent, CrawlItem, PostQueue, WebRequestFactory, log_info, log_success, log_warning,
};

mod cli;

/// 由页面地址生成文件名
fn filename_for(url: &str, content: &CrawlContent, pattern: &Regex) -> String {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let stem = pattern.replace_all(without_scheme.trim_end_matches('/'), "_");
    let extension = match content {
        CrawlContent::Document(_) => "json",
        _ => "txt",
    };
    format!("{}.{}", stem, extension)
}

/// 依次请求页面并放入队列，返回入队数量
async fn produce(
    factory: &WebRequestFactory,
    args: &cli::Cli,
    queue: &PostQueue<CrawlItem>,
    manager: &CrawlManager,
) -> Result<usize> {
    let pattern = Regex::new(r"[^A-Za-z0-9._-]+")?;
    let mut enqueued = 0;

    for url in &args.urls {
        if manager.is_stopped() {
            warn!("抓取已停止，不再请求新的页面");
            break;
        }

        if !factory.check_reachable(url).await {
            log_warning!("页面不可访问，跳过: {}", url);
            continue;
        }

        let request = factory.build_get(url, args.referer.as_deref(), None, true)?;
        let response = match factory.drain_to_response(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!("请求 {} 失败: {}", url, e);
                continue;
            }
        };
        if !response.status.is_success() {
            warn!("请求 {} 返回状态码 {}", url, response.status);
            continue;
        }

        let is_json = response
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("json"));
        let content = if is_json {
            match serde_json::from_str(&response.body) {
                Ok(value) => CrawlContent::Document(value),
                Err(e) => {
                    debug!("{} 不是有效的 JSON，按文本保存: {}", url, e);
                    CrawlContent::Text(response.body)
                }
            }
        } else {
            CrawlContent::Text(response.body)
        };

        let filename = match &args.output_file {
            Some(name) => name.clone(),
            None => filename_for(url, &content, &pattern),
        };

        // 下载器停止后队列不会再腾出空位
        let cancel = manager.cancellation_token();
        tokio::select! {
            result = queue.enqueue(CrawlItem::new(filename, content)) => {
                if let Err(e) = result {
                    warn!("无法放入队列: {}", e);
                    break;
                }
                enqueued += 1;
            }
            _ = cancel.cancelled() => {
                warn!("抓取已停止，丢弃尚未入队的内容");
                break;
            }
        }
    }

    Ok(enqueued)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    // 初始化日志
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let settings = args.settings().await.context("读取配置失败")?;
    info!("下载目录: {}", settings.download_location.display());

    let factory = WebRequestFactory::new(&settings.request).context("创建请求客户端失败")?;
    let queue = PostQueue::with_capacity(settings.queue_capacity);
    let manager = Arc::new(CrawlManager::new());
    let downloader = BlogDownloader::new(
        &settings,
        queue.clone(),
        Arc::clone(&manager),
        Arc::new(ConsoleShell),
    );
    debug!("启动 {} 个下载器", downloader.worker_count());

    {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log_warning!("收到中断信号，正在停止...");
                manager.stop_crawl();
            }
        });
    }

    let download = tokio::spawn(async move { downloader.download().await });

    log_info!("开始抓取 {} 个页面", args.urls.len());
    let produced = produce(&factory, &args, &queue, &manager).await;
    queue.complete_adding();

    let stats = download.await??;
    let produced = produced?;

    PrettyLogger::completion_summary(vec![
        format!("入队: {}", produced),
        format!("写入成功: {}", stats.persisted),
        format!("写入失败: {}", stats.failed + stats.storage_exhausted),
    ]);

    if manager.is_stopped() {
        anyhow::bail!("抓取已被中途停止");
    }
    log_success!("全部内容已写入 {}", settings.download_location.display());
    Ok(())
}

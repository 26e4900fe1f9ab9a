use clap::Parser;
use std::path::PathBuf;

use blog_downloader::CrawlSettings;

/// 博客内容抓取工具
#[derive(Parser, Debug)]
#[command(name = "blogdl")]
#[command(version = "0.1")]
#[command(author = "rpeng252@gmail.com")]
#[command(about = "抓取博客页面并写入本地目录", long_about = None)]
pub struct Cli {
    /// 要抓取的页面地址，可以重复指定
    #[arg(long = "url", value_name = "URL", required = true)]
    #[arg(value_hint = clap::ValueHint::Url)]
    pub urls: Vec<String>,

    /// JSON 配置文件，命令行参数优先
    #[arg(long, value_name = "FILE")]
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// 下载目录
    #[arg(long, value_name = "DIR")]
    #[arg(value_hint = clap::ValueHint::DirPath)]
    pub output_dir: Option<PathBuf>,

    /// 所有页面追加写入同一个文件，不指定时每个页面一个文件
    #[arg(long, value_name = "NAME")]
    pub output_file: Option<String>,

    /// 请求使用的 Referer
    #[arg(long, value_name = "URL")]
    pub referer: Option<String>,

    #[arg(long, value_name = "下载器数量")]
    pub workers: Option<usize>,

    #[arg(long, value_name = "队列容量")]
    pub queue_capacity: Option<usize>,

    #[arg(long, value_name = "同时写盘数")]
    pub max_concurrent_writes: Option<usize>,

    /// 请求超时（秒）
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    #[arg(long, value_name = "UA")]
    pub user_agent: Option<String>,

    /// 输出调试日志
    #[arg(long, short)]
    pub verbose: bool,
}

impl Cli {
    /// 合并配置文件和命令行参数
    pub async fn settings(&self) -> anyhow::Result<CrawlSettings> {
        let mut settings = match &self.config {
            Some(path) => CrawlSettings::load(path).await?,
            None => CrawlSettings::default(),
        };

        if let Some(dir) = &self.output_dir {
            settings.download_location = dir.clone();
        }
        if let Some(workers) = self.workers {
            settings.workers = workers;
        }
        if let Some(capacity) = self.queue_capacity {
            settings.queue_capacity = Some(capacity);
        }
        if let Some(limit) = self.max_concurrent_writes {
            settings.max_concurrent_writes = Some(limit);
        }
        if let Some(timeout) = self.timeout {
            settings.request.timeout_secs = timeout;
        }
        if let Some(user_agent) = &self.user_agent {
            settings.request.user_agent = user_agent.clone();
        }

        Ok(settings)
    }
}

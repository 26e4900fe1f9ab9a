use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------------------------------

/// 请求工厂的配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestSettings {
    pub timeout_secs: u64,      // 单次请求超时（秒）
    pub user_agent: String,      // User-Agent
    pub accept_language: String, // Accept-Language
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/135.0.0.0 Safari/537.36".to_string(),
            accept_language: "zh-CN,zh;q=0.9,en;q=0.8".to_string(),
        }
    }
}

// -----------------------------------------------------------------------------------------------

/// 一次抓取的配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlSettings {
    pub download_location: PathBuf,           // 下载目录
    pub workers: usize,                       // 消费同一队列的下载器数量
    pub queue_capacity: Option<usize>,        // 队列容量，None 表示不限
    pub max_concurrent_writes: Option<usize>, // 每个下载器同时写盘的任务数，None 表示不限
    pub request: RequestSettings,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            download_location: PathBuf::from("./downloads"),
            workers: 1,
            queue_capacity: Some(256),
            max_concurrent_writes: None,
            request: RequestSettings::default(),
        }
    }
}

impl CrawlSettings {
    /// 从 JSON 文件读取配置，缺失的字段使用默认值
    pub async fn load(path: &Path) -> Result<Self, std::io::Error> {
        let raw = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&raw).map_err(std::io::Error::other)
    }
}

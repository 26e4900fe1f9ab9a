use std::path::{Component, Path, PathBuf};

use serde_json::Value;

use super::error::DownloadError;

/// 待写盘的内容，每种内容对应一种写盘方式
#[derive(Debug, Clone, PartialEq)]
pub enum CrawlContent {
    Document(Value), // 结构化文档，格式化输出
    Text(String),    // 文本，原样写入
    Binary(Vec<u8>), // 字节，原样写入
}

impl CrawlContent {
    /// 序列化为追加到文件的字节
    ///
    /// 文档使用两空格缩进、不带前导声明，键按字典序输出，末尾补一个换行，
    /// 相同输入总是得到相同字节。
    pub fn serialize(&self) -> Result<Vec<u8>, DownloadError> {
        match self {
            CrawlContent::Document(value) => {
                let mut bytes = serde_json::to_vec_pretty(value)?;
                bytes.push(b'\n');
                Ok(bytes)
            }
            CrawlContent::Text(text) => Ok(text.as_bytes().to_vec()),
            CrawlContent::Binary(bytes) => Ok(bytes.clone()),
        }
    }
}

/// 爬虫发现的一条内容，入队后不再修改
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlItem {
    pub content: CrawlContent,
    pub filename: String, // 相对于下载目录的文件名
}

impl CrawlItem {
    pub fn new(filename: impl Into<String>, content: CrawlContent) -> Self {
        Self {
            content,
            filename: filename.into(),
        }
    }

    pub fn document(filename: impl Into<String>, value: Value) -> Self {
        Self::new(filename, CrawlContent::Document(value))
    }

    pub fn text(filename: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(filename, CrawlContent::Text(text.into()))
    }
}

/// 拼接下载目录和文件名，文件名不能跳出下载目录
pub fn file_location(download_location: &Path, filename: &str) -> Result<PathBuf, DownloadError> {
    let relative = Path::new(filename);
    let is_plain = !filename.is_empty()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));

    if !is_plain {
        return Err(DownloadError::InvalidFilename(filename.to_string()));
    }

    Ok(download_location.join(relative))
}

// --------------------------------------------------------------------

/// 一个下载器的处理结果统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadStats {
    pub dispatched: usize,        // 已取出并派发的内容
    pub persisted: usize,         // 写盘成功
    pub failed: usize,            // 单条失败，已丢弃
    pub storage_exhausted: usize, // 因磁盘空间不足失败
}

impl DownloadStats {
    pub fn merge(&mut self, other: &DownloadStats) {
        self.dispatched += other.dispatched;
        self.persisted += other.persisted;
        self.failed += other.failed;
        self.storage_exhausted += other.storage_exhausted;
    }
}

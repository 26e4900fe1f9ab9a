use std::io::{self, ErrorKind};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("IO错误: {0}")]
    IoError(#[from] io::Error),

    #[error("序列化失败: {0}")]
    SerializeError(#[from] serde_json::Error),

    #[error("无效的文件名: {0}")]
    InvalidFilename(String),
}

impl DownloadError {
    /// 磁盘空间或配额耗尽，整个抓取都应停止
    pub fn is_storage_exhausted(&self) -> bool {
        match self {
            DownloadError::IoError(e) => is_storage_exhausted(e),
            _ => false,
        }
    }
}

pub fn is_storage_exhausted(error: &io::Error) -> bool {
    if matches!(
        error.kind(),
        ErrorKind::StorageFull | ErrorKind::QuotaExceeded
    ) {
        return true;
    }

    error.raw_os_error().is_some_and(is_disk_full_code)
}

// ERROR_HANDLE_DISK_FULL / ERROR_DISK_FULL，可能以 HRESULT 形式出现
#[cfg(windows)]
fn is_disk_full_code(code: i32) -> bool {
    let low = code & 0xFFFF;
    low == 0x27 || low == 0x70
}

// ENOSPC
#[cfg(not(windows))]
fn is_disk_full_code(code: i32) -> bool {
    code == 28
}

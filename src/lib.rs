pub mod common;
pub mod downloader;

pub use common::client::client::WebRequestFactory;
pub use common::control::{PauseToken, PauseTokenSource};
pub use common::models::{CrawlSettings, RequestSettings};
pub use common::queue::{PostQueue, QueueError};
pub use downloader::models::{CrawlContent, CrawlItem, DownloadStats};

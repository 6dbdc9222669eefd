pub mod scheduler;

pub use scheduler::{DownloadItem, DownloadScheduler, DownloadStatus};

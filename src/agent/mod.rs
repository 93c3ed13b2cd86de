pub mod engine;
pub mod job;
pub mod ratelimit;

pub use engine::DownloadAgent;
pub use job::{DlState, DownloadJob, HeaderAction, JobTarget};
pub use ratelimit::RateLimiter;

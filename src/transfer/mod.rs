// 分片传输模块

pub mod assembler;
pub mod chunk;
pub mod dispatcher;
pub mod engine;
pub mod io;
pub mod job;
pub mod manager;
pub mod progress;
pub mod retry;

pub use assembler::{DownloadAssembler, PartResult, UploadAssembler};
pub use chunk::{plan_chunks, use_multipart, Chunk, ChunkManager, ChunkState};
pub use dispatcher::{DispatchReport, Dispatcher};
pub use engine::TransferEngine;
pub use io::{DownloadSink, UploadSource};
pub use job::{Direction, TransferJob, TransferResult};
pub use manager::{
    endpoint_comparisons, EndpointComparison, HttpConnector, StoreConnector, TransferManager,
};
pub use progress::{ProgressCallback, ProgressSnapshot, TransferProgress};
pub use retry::{backoff_delay, call_with_retry, RetryController, RetryDecision, RetryPolicy};

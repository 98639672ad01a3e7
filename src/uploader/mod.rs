// 上传引擎模块
//
// - 分片规划（chunk）
// - 会话状态机（session）
// - 进度聚合（progress）
// - 传输接口（transport）
// - 分片上传引擎（engine）
// - 直传（direct）

pub mod chunk;
pub mod direct;
pub mod engine;
pub mod error;
pub mod progress;
pub mod session;
pub mod transport;

pub use chunk::{
    decide_chunk_size, plan_chunks, ChunkDescriptor, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE,
    MIN_RECOMMENDED_CHUNK_SIZE, SINGLE_CHUNK_THRESHOLD,
};
pub use direct::{
    DirectUploadOptions, DirectUploader, Privacy, DEFAULT_DIRECT_UPLOAD_PATH,
    DIRECT_UPLOAD_TIMEOUT,
};
pub use engine::{UploadEngine, UploadOptions, DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES};
pub use error::{UploadError, UploadErrorKind, UploadResult};
pub use progress::{ProgressCallback, ProgressSink, ProgressTracker, UploadProgress};
pub use session::{UploadFile, UploadSession, UploadState, DEFAULT_MIME_TYPE};
pub use transport::{
    ChunkRequest, CompleteRequest, InitRequest, InitResponse, TransportError, UploadTransport,
};

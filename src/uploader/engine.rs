// 上传引擎
//
// 单个文件的完整上传流程：
// 1. 初始化会话（服务器分配 uploadId，可能返回推荐分片大小）
// 2. 规划分片，保存续传检查点
// 3. 工作池并发上传分片
// 4. 所有分片完成后请求合并
//
// 并发上传策略：
// - JoinSet 管理 min(并发数, 待上传分片数) 个 worker
// - worker 通过共享原子计数器领取下一个分片（每个分片只会被领取一次）
// - 取消令牌分两级：会话令牌 → 本轮传输的子令牌，每个请求都与令牌竞争
// - 任一分片失败即取消子令牌，其余 worker 的在途请求随之中止

use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::chunk::{decide_chunk_size, plan_chunks, ChunkDescriptor};
use super::error::{UploadError, UploadResult};
use super::progress::{ProgressCallback, ProgressSink, ProgressTracker, UploadProgress};
use super::session::{UploadFile, UploadSession, UploadState};
use super::transport::{
    ChunkRequest, CompleteRequest, InitRequest, TransportError, UploadTransport,
};
use crate::persistence::{ResumeMeta, ResumeRecord, ResumeStore};

// =====================================================
// 重试配置
// =====================================================

/// 默认并发分片数
pub const DEFAULT_CONCURRENCY: usize = 4;

/// 默认最大重试次数（0 表示分片失败立即终止上传）
pub const DEFAULT_MAX_RETRIES: u32 = 0;

/// 初始退避延迟（毫秒）
const INITIAL_BACKOFF_MS: u64 = 100;

/// 最大退避延迟（毫秒）
const MAX_BACKOFF_MS: u64 = 5000;

/// 限流时的额外等待时间（毫秒）
const RATE_LIMIT_BACKOFF_MS: u64 = 10000;

/// 计算指数退避延迟
///
/// # 延迟序列
/// - retry_count=0: 100ms
/// - retry_count=1: 200ms
/// - retry_count=2: 400ms
/// - 最大: 5000ms（限流时至少 10000ms）
fn calculate_backoff_delay(retry_count: u32, error: &TransportError) -> u64 {
    let base_delay = INITIAL_BACKOFF_MS.saturating_mul(2u64.saturating_pow(retry_count));
    let delay = base_delay.min(MAX_BACKOFF_MS);

    if matches!(error, TransportError::Http { status: 429, .. }) {
        delay.max(RATE_LIMIT_BACKOFF_MS)
    } else {
        delay
    }
}

/// 上传选项
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// 最大并发分片数
    pub concurrency: usize,
    /// 单个分片的最大重试次数
    pub max_retries: u32,
    /// 固定分片大小（None 时按文件大小和服务器推荐值自动决定）
    pub chunk_size: Option<u64>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            chunk_size: None,
        }
    }
}

// =====================================================
// 上传引擎
// =====================================================

/// 上传引擎
///
/// 一个引擎对应一次上传（`upload` 或 `resume` 只能调用一次），
/// 合并失败后可以通过 `retry_completion` 重试合并。
pub struct UploadEngine {
    /// 传输层
    transport: Arc<dyn UploadTransport>,
    /// 上传选项
    options: UploadOptions,
    /// 续传存储（None 表示不保存检查点）
    resume_store: Option<Arc<ResumeStore>>,
    /// 进度回调
    progress_callback: Option<ProgressCallback>,
    /// 当前状态
    state: RwLock<UploadState>,
    /// 上传会话（初始化完成后才有）
    session: RwLock<Option<UploadSession>>,
    /// 本次上传的进度
    tracker: RwLock<Option<Arc<ProgressTracker>>>,
    /// 所有分片都已被服务器确认
    chunks_done: AtomicBool,
    /// 会话取消令牌
    cancel_token: CancellationToken,
}

impl UploadEngine {
    /// 创建上传引擎
    pub fn new(transport: Arc<dyn UploadTransport>, options: UploadOptions) -> Self {
        Self {
            transport,
            options,
            resume_store: None,
            progress_callback: None,
            state: RwLock::new(UploadState::Idle),
            session: RwLock::new(None),
            tracker: RwLock::new(None),
            chunks_done: AtomicBool::new(false),
            cancel_token: CancellationToken::new(),
        }
    }

    /// 启用断点续传检查点
    pub fn with_resume_store(mut self, store: Arc<ResumeStore>) -> Self {
        self.resume_store = Some(store);
        self
    }

    /// 设置进度回调
    pub fn on_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    /// 使用外部取消令牌（会话令牌作为它的子令牌）
    pub fn with_parent_token(mut self, parent: &CancellationToken) -> Self {
        self.cancel_token = parent.child_token();
        self
    }

    pub fn state(&self) -> UploadState {
        *self.state.read()
    }

    pub fn session(&self) -> Option<UploadSession> {
        self.session.read().clone()
    }

    /// 当前进度（上传开始前为 None）
    pub fn progress(&self) -> Option<UploadProgress> {
        self.tracker.read().as_ref().map(|t| t.snapshot())
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 取消上传
    ///
    /// 在途的初始化请求和所有分片请求都会被中止，不会发起合并请求，续传记录保留
    pub fn cancel(&self) {
        info!("取消上传: state={}", self.state());
        self.cancel_token.cancel();
    }

    /// 上传文件
    ///
    /// # 返回
    /// 合并接口返回的 JSON（原样）
    pub async fn upload(&self, file: UploadFile) -> UploadResult<Value> {
        self.transition(UploadState::Initializing)?;

        let file_size = file.size();
        info!(
            "开始上传: file={}, size={} bytes, mime={}",
            file.name, file_size, file.mime_type
        );

        // 1. 初始化会话
        let request = InitRequest {
            filename: file.name.clone(),
            size: file_size,
            mime: file.mime_type.clone(),
            extra: file.extra.clone(),
        };
        let response = tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => Err(TransportError::Canceled),
            r = self.transport.init(&request) => r,
        };
        let response = match response {
            Ok(r) => r,
            Err(e) => return Err(self.fail(self.map_error(e, UploadError::InitFailed))),
        };
        let upload_id = match response.upload_id.filter(|id| !id.is_empty()) {
            Some(id) => id,
            None => {
                let err = UploadError::InitFailed(TransportError::MissingUploadId.message());
                return Err(self.fail(err));
            }
        };

        // 2. 规划分片
        let chunk_size = self
            .options
            .chunk_size
            .filter(|s| *s > 0)
            .unwrap_or_else(|| decide_chunk_size(file_size, response.recommended_chunk_size));
        let chunks = plan_chunks(&file.data, chunk_size);

        let session = UploadSession {
            upload_id,
            total_chunks: chunks.len(),
            chunk_size,
            file_name: file.name,
            file_size,
            mime_type: file.mime_type,
            extra: file.extra,
        };
        info!(
            "上传会话已建立: upload_id={}, 分片大小={} bytes, 分片数量={}",
            session.upload_id, session.chunk_size, session.total_chunks
        );
        *self.session.write() = Some(session.clone());

        // 3. 续传检查点
        let meta = ResumeMeta::new(session.clone());
        if let Some(store) = &self.resume_store {
            store.checkpoint(&file.data, &meta).await;
        }

        self.run_transfer(session, chunks, &meta).await
    }

    /// 从续传记录恢复上传
    ///
    /// 跳过初始化，已确认的分片不再上传（进度中直接计为已发送）
    pub async fn resume(&self, record: ResumeRecord) -> UploadResult<Value> {
        let session = record.meta.session.clone();
        let chunks = plan_chunks(&record.file, session.chunk_size);
        if chunks.len() != session.total_chunks {
            return Err(UploadError::InvalidState {
                from: format!("{} chunks recorded", session.total_chunks),
                to: format!("{} chunks planned", chunks.len()),
            });
        }

        info!(
            "恢复上传: upload_id={}, 已完成 {}/{} 个分片",
            session.upload_id,
            record.meta.completed_chunks.len(),
            session.total_chunks
        );
        *self.session.write() = Some(session.clone());

        self.run_transfer(session, chunks, &record.meta).await
    }

    /// 重试合并（所有分片已上传，上次合并失败）
    pub async fn retry_completion(&self) -> UploadResult<Value> {
        if !self.chunks_done.load(Ordering::Acquire) {
            return Err(UploadError::InvalidState {
                from: self.state().to_string(),
                to: UploadState::Completing.to_string(),
            });
        }
        let session = self.session().ok_or_else(|| UploadError::InvalidState {
            from: self.state().to_string(),
            to: UploadState::Completing.to_string(),
        })?;

        info!("重试合并: upload_id={}", session.upload_id);
        self.complete(&session).await
    }

    /// 分片上传 + 合并
    async fn run_transfer(
        &self,
        session: UploadSession,
        chunks: Vec<ChunkDescriptor>,
        meta: &ResumeMeta,
    ) -> UploadResult<Value> {
        self.transition(UploadState::Transferring)?;

        let tracker = Arc::new(ProgressTracker::new(
            chunks.iter().map(|c| c.size()).collect(),
            self.progress_callback.clone(),
        ));
        *self.tracker.write() = Some(tracker.clone());

        let mut pending = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            if meta.completed_chunks.contains(&chunk.index) {
                tracker.mark_chunk_done(chunk.index);
            } else {
                pending.push(chunk);
            }
        }

        if let Err(e) = self.transfer_chunks(&session, pending, tracker).await {
            return Err(self.fail(e));
        }
        self.chunks_done.store(true, Ordering::Release);

        self.complete(&session).await
    }

    /// 并发上传分片
    async fn transfer_chunks(
        &self,
        session: &UploadSession,
        pending: Vec<ChunkDescriptor>,
        tracker: Arc<ProgressTracker>,
    ) -> UploadResult<()> {
        let worker_count = self.options.concurrency.max(1).min(pending.len());
        info!(
            "[并发上传] 开始上传 {} 个分片，并发数: {}",
            pending.len(),
            worker_count
        );

        let transfer_token = self.cancel_token.child_token();
        let context = Arc::new(TransferContext {
            transport: self.transport.clone(),
            upload_id: session.upload_id.clone(),
            file_name: session.file_name.clone(),
            total_chunks: session.total_chunks,
            pending,
            next_slot: AtomicUsize::new(0),
            tracker,
            token: transfer_token.clone(),
            resume_store: self.resume_store.clone(),
            max_retries: self.options.max_retries,
        });

        let mut join_set = JoinSet::new();
        for _ in 0..worker_count {
            join_set.spawn(run_worker(context.clone()));
        }

        let mut first_failure: Option<(usize, TransportError)> = None;
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err((_, TransportError::Canceled))) => {}
                Ok(Err((index, e))) => {
                    if first_failure.is_none() {
                        error!("[分片#{}] 上传失败，终止其余分片: {}", index, e);
                        transfer_token.cancel();
                        first_failure = Some((index, e));
                    }
                }
                Err(e) => {
                    if !e.is_cancelled() {
                        error!("分片任务异常: {}", e);
                    }
                }
            }
        }

        if self.cancel_token.is_cancelled() {
            return Err(UploadError::Canceled);
        }
        if let Some((index, e)) = first_failure {
            return Err(UploadError::ChunkTransferFailed {
                index,
                message: e.message(),
            });
        }
        if !context.tracker.is_completed() {
            return Err(UploadError::ChunkTransferFailed {
                index: context.first_unfinished().unwrap_or_default(),
                message: "分片任务异常退出".to_string(),
            });
        }

        info!("[并发上传] 所有 {} 个分片上传完成", session.total_chunks);
        Ok(())
    }

    /// 合并
    async fn complete(&self, session: &UploadSession) -> UploadResult<Value> {
        self.transition(UploadState::Completing)?;

        let request = CompleteRequest {
            upload_id: session.upload_id.clone(),
            extra: session.extra.clone(),
        };
        let result = tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => Err(TransportError::Canceled),
            r = self.transport.complete(&request) => r,
        };

        match result {
            Ok(value) => {
                self.transition(UploadState::Completed)?;
                if let Some(store) = &self.resume_store {
                    store.discard(&session.upload_id).await;
                }
                info!("上传完成: upload_id={}", session.upload_id);
                Ok(value)
            }
            Err(e) => Err(self.fail(self.map_error(e, UploadError::CompletionFailed))),
        }
    }

    /// 切换状态
    fn transition(&self, next: UploadState) -> UploadResult<()> {
        let mut state = self.state.write();
        let from = *state;
        state.transition(next)?;
        debug!("上传状态: {} -> {}", from, next);
        Ok(())
    }

    /// 进入失败或取消状态，返回原错误
    fn fail(&self, err: UploadError) -> UploadError {
        let next = if err.is_canceled() {
            warn!("上传已取消");
            UploadState::Canceled
        } else {
            error!("上传失败: {}", err);
            UploadState::Failed
        };
        let mut state = self.state.write();
        if state.can_transition_to(next) {
            *state = next;
        }
        err
    }

    /// 传输错误转换为当前阶段的错误（会话已取消时一律视为取消）
    fn map_error(&self, err: TransportError, phase: fn(String) -> UploadError) -> UploadError {
        if self.cancel_token.is_cancelled() || err == TransportError::Canceled {
            UploadError::Canceled
        } else {
            phase(err.message())
        }
    }
}

// =====================================================
// 分片上传 worker
// =====================================================

/// worker 共享的传输上下文
struct TransferContext {
    transport: Arc<dyn UploadTransport>,
    upload_id: String,
    file_name: String,
    total_chunks: usize,
    /// 待上传分片（按索引排序）
    pending: Vec<ChunkDescriptor>,
    /// 下一个待领取的位置
    next_slot: AtomicUsize,
    tracker: Arc<ProgressTracker>,
    /// 本轮传输的取消令牌
    token: CancellationToken,
    resume_store: Option<Arc<ResumeStore>>,
    max_retries: u32,
}

impl TransferContext {
    fn first_unfinished(&self) -> Option<usize> {
        self.pending
            .iter()
            .map(|c| c.index)
            .find(|i| !self.tracker.is_chunk_done(*i))
    }
}

/// worker 主循环：领取分片直到没有剩余或被取消
async fn run_worker(ctx: Arc<TransferContext>) -> Result<(), (usize, TransportError)> {
    loop {
        if ctx.token.is_cancelled() {
            return Ok(());
        }
        let slot = ctx.next_slot.fetch_add(1, Ordering::AcqRel);
        let Some(chunk) = ctx.pending.get(slot) else {
            return Ok(());
        };

        upload_single_chunk(&ctx, chunk)
            .await
            .map_err(|e| (chunk.index, e))?;

        ctx.tracker.mark_chunk_done(chunk.index);
        debug!(
            "[分片#{}] ✓ 上传成功 ({}/{} bytes)",
            chunk.index,
            ctx.tracker.sent_bytes(),
            ctx.tracker.total_bytes()
        );

        if let Some(store) = &ctx.resume_store {
            store.record_chunk_done(&ctx.upload_id, chunk.index).await;
        }
    }
}

/// 上传单个分片（可重试的错误按指数退避重试）
async fn upload_single_chunk(
    ctx: &TransferContext,
    chunk: &ChunkDescriptor,
) -> Result<(), TransportError> {
    let mut retry = 0u32;

    loop {
        let request = ChunkRequest {
            upload_id: ctx.upload_id.clone(),
            index: chunk.index,
            total: ctx.total_chunks,
            file_name: ctx.file_name.clone(),
            payload: chunk.payload.clone(),
        };
        let sink: Arc<dyn ProgressSink> = ctx.tracker.clone();
        let call = AssertUnwindSafe(ctx.transport.upload_chunk(request, sink)).catch_unwind();

        let result = tokio::select! {
            biased;
            _ = ctx.token.cancelled() => Err(TransportError::Canceled),
            r = call => r.unwrap_or_else(|_| {
                Err(TransportError::Network("分片传输任务异常".to_string()))
            }),
        };

        let err = match result {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        if !err.is_retriable() || retry >= ctx.max_retries {
            if err != TransportError::Canceled {
                error!("[分片#{}] 上传失败: {}", chunk.index, err);
            }
            return Err(err);
        }

        let backoff_ms = calculate_backoff_delay(retry, &err);
        warn!(
            "[分片#{}] 上传失败，等待 {}ms 后重试 ({}/{}): {}",
            chunk.index,
            backoff_ms,
            retry + 1,
            ctx.max_retries,
            err
        );
        ctx.tracker.reset_chunk(chunk.index);

        tokio::select! {
            biased;
            _ = ctx.token.cancelled() => return Err(TransportError::Canceled),
            _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
        }
        retry += 1;
    }
}

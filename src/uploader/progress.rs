// 上传进度聚合
//
// 每个分片一个字节计数槽位，只由负责该分片的 worker 写入（fetch_max，单调递增）。
// 聚合时对所有槽位求和；回调在锁内触发，保证调用方看到的已发送字节数不下降。

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// 聚合进度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UploadProgress {
    /// 已发送字节数
    pub sent_bytes: u64,
    /// 总字节数
    pub total_bytes: u64,
    /// 百分比（向下取整，全部发送完毕才为 100）
    pub percent: u8,
}

impl UploadProgress {
    pub fn new(sent_bytes: u64, total_bytes: u64) -> Self {
        let percent = if total_bytes == 0 {
            0
        } else {
            (sent_bytes.min(total_bytes) as u128 * 100 / total_bytes as u128) as u8
        };
        Self {
            sent_bytes,
            total_bytes,
            percent,
        }
    }

    /// 已全部完成
    pub fn completed(total_bytes: u64) -> Self {
        Self {
            sent_bytes: total_bytes,
            total_bytes,
            percent: 100,
        }
    }
}

/// 进度回调
pub type ProgressCallback = Arc<dyn Fn(UploadProgress) + Send + Sync>;

/// 进度接收端（由传输层在发送字节时调用）
pub trait ProgressSink: Send + Sync {
    /// 报告某分片当前已发送的字节数（累计值，不是增量）
    fn report(&self, chunk_index: usize, bytes_sent: u64);
}

/// 单次上传的进度状态
pub struct ProgressTracker {
    /// 每个分片的已发送字节数
    sent: Vec<AtomicU64>,
    /// 每个分片的大小
    sizes: Vec<u64>,
    /// 每个分片是否已确认
    done: Vec<AtomicBool>,
    /// 已完成分片数
    completed_chunks: AtomicUsize,
    total_bytes: u64,
    /// 上次回调的进度（同时用作回调互斥锁）
    last_emitted: Mutex<Option<UploadProgress>>,
    callback: Option<ProgressCallback>,
}

impl ProgressTracker {
    /// 创建进度状态
    ///
    /// # 参数
    /// * `sizes` - 各分片大小（按索引）
    /// * `callback` - 调用方进度回调
    pub fn new(sizes: Vec<u64>, callback: Option<ProgressCallback>) -> Self {
        let total_bytes = sizes.iter().sum();
        Self {
            sent: sizes.iter().map(|_| AtomicU64::new(0)).collect(),
            done: sizes.iter().map(|_| AtomicBool::new(false)).collect(),
            sizes,
            completed_chunks: AtomicUsize::new(0),
            total_bytes,
            last_emitted: Mutex::new(None),
            callback,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn chunk_count(&self) -> usize {
        self.sizes.len()
    }

    /// 当前聚合进度
    pub fn snapshot(&self) -> UploadProgress {
        let sent_bytes = self.sent_bytes();
        if self.is_completed() {
            return UploadProgress::completed(self.total_bytes);
        }
        let mut progress = UploadProgress::new(sent_bytes, self.total_bytes);
        // 最后一个分片的字节可能已写完但服务器尚未确认
        progress.percent = progress.percent.min(99);
        progress
    }

    /// 已发送字节数
    pub fn sent_bytes(&self) -> u64 {
        self.sent.iter().map(|s| s.load(Ordering::Acquire)).sum()
    }

    /// 所有分片都已确认
    pub fn is_completed(&self) -> bool {
        self.completed_chunks.load(Ordering::Acquire) >= self.sizes.len()
    }

    /// 分片是否已确认
    pub fn is_chunk_done(&self, chunk_index: usize) -> bool {
        self.done
            .get(chunk_index)
            .map(|d| d.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// 标记分片完成（服务器已确认），计数补齐到分片大小
    pub fn mark_chunk_done(&self, chunk_index: usize) {
        let Some(size) = self.sizes.get(chunk_index).copied() else {
            return;
        };
        if self.done[chunk_index].swap(true, Ordering::AcqRel) {
            return;
        }
        self.sent[chunk_index].fetch_max(size, Ordering::AcqRel);
        self.completed_chunks.fetch_add(1, Ordering::AcqRel);
        self.emit();
    }

    /// 重置分片计数（重试前调用）
    ///
    /// 聚合值可能短暂回落，回调侧通过 `last_emitted` 保证不下降
    pub fn reset_chunk(&self, chunk_index: usize) {
        if let Some(slot) = self.sent.get(chunk_index) {
            slot.store(0, Ordering::Release);
        }
    }

    /// 触发回调
    ///
    /// 100% 只回调一次，之后的事件被丢弃
    fn emit(&self) {
        let Some(callback) = &self.callback else {
            return;
        };

        let mut last = self.last_emitted.lock();
        let mut progress = self.snapshot();
        if let Some(prev) = *last {
            if prev.percent == 100 {
                return;
            }
            if progress.sent_bytes < prev.sent_bytes {
                progress = prev;
            }
        }
        *last = Some(progress);
        callback(progress);
    }
}

impl ProgressSink for ProgressTracker {
    fn report(&self, chunk_index: usize, bytes_sent: u64) {
        let Some(size) = self.sizes.get(chunk_index).copied() else {
            return;
        };
        self.sent[chunk_index].fetch_max(bytes_sent.min(size), Ordering::AcqRel);
        self.emit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collecting_tracker(
        sizes: Vec<u64>,
    ) -> (Arc<ProgressTracker>, Arc<Mutex<Vec<UploadProgress>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let callback: ProgressCallback = Arc::new(move |p| sink.lock().push(p));
        (Arc::new(ProgressTracker::new(sizes, Some(callback))), events)
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(UploadProgress::new(0, 1000).percent, 0);
        assert_eq!(UploadProgress::new(250, 1000).percent, 25);
        assert_eq!(UploadProgress::new(999, 1000).percent, 99);
        assert_eq!(UploadProgress::new(1000, 1000).percent, 100);
        assert_eq!(UploadProgress::new(0, 0).percent, 0);
    }

    #[test]
    fn test_aggregate_is_monotonic_and_reaches_100_last() {
        let (tracker, events) = collecting_tracker(vec![100, 100, 50]);

        // 交错上报
        tracker.report(0, 10);
        tracker.report(1, 40);
        tracker.report(0, 60);
        tracker.report(2, 50);
        tracker.report(1, 100);
        tracker.mark_chunk_done(1);
        tracker.report(0, 100);
        tracker.mark_chunk_done(0);
        tracker.mark_chunk_done(2);

        let events = events.lock();
        for pair in events.windows(2) {
            assert!(pair[1].sent_bytes >= pair[0].sent_bytes);
            assert!(pair[1].percent >= pair[0].percent);
        }

        let (last, rest) = events.split_last().unwrap();
        assert_eq!(last.percent, 100);
        assert_eq!(last.sent_bytes, 250);
        assert!(rest.iter().all(|p| p.percent < 100));
    }

    #[test]
    fn test_stale_report_is_ignored() {
        let (tracker, _events) = collecting_tracker(vec![100]);
        tracker.report(0, 80);
        tracker.report(0, 30);
        assert_eq!(tracker.sent_bytes(), 80);
        // 超过分片大小的上报被截断
        tracker.report(0, 500);
        assert_eq!(tracker.sent_bytes(), 100);
        assert_eq!(tracker.snapshot().percent, 99);
    }

    #[test]
    fn test_reset_does_not_regress_callback() {
        let (tracker, events) = collecting_tracker(vec![100, 100]);
        tracker.report(0, 90);
        tracker.reset_chunk(0);
        tracker.report(1, 10);

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert!(events[1].sent_bytes >= events[0].sent_bytes);
    }

    #[test]
    fn test_completion_emitted_once() {
        let (tracker, events) = collecting_tracker(vec![10, 10]);
        tracker.mark_chunk_done(0);
        tracker.mark_chunk_done(1);
        // 重复确认和迟到的上报都不再回调
        tracker.mark_chunk_done(1);
        tracker.report(0, 10);

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].percent, 100);
        assert!(tracker.is_chunk_done(1));
    }

    #[test]
    fn test_empty_file_completes() {
        let (tracker, events) = collecting_tracker(vec![0]);
        assert_eq!(tracker.snapshot().percent, 0);
        tracker.mark_chunk_done(0);
        assert_eq!(events.lock().last().unwrap().percent, 100);
    }
}

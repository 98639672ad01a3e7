// 可报告进度的请求体
//
// reqwest 不提供上传进度事件，这里把数据切成小块做成流，
// 每块被 hyper 取走时回调一次累计字节数

use bytes::Bytes;
use futures::StreamExt;

/// 进度上报粒度: 64KB
pub const PROGRESS_PIECE_SIZE: usize = 64 * 1024;

/// 将数据按固定大小切块（零拷贝）
pub fn split_pieces(data: &Bytes, piece_size: usize) -> Vec<Bytes> {
    let piece_size = piece_size.max(1);
    let mut pieces = Vec::with_capacity(data.len().div_ceil(piece_size));
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + piece_size).min(data.len());
        pieces.push(data.slice(offset..end));
        offset = end;
    }
    pieces
}

/// 构造带进度回调的请求体
///
/// # 参数
/// * `data` - 请求数据
/// * `on_progress` - 累计已发送字节数回调
pub fn progress_body<F>(data: Bytes, on_progress: F) -> reqwest::Body
where
    F: Fn(u64) + Send + Sync + 'static,
{
    let mut sent = 0u64;
    let stream = futures::stream::iter(split_pieces(&data, PROGRESS_PIECE_SIZE)).map(
        move |piece| {
            sent += piece.len() as u64;
            on_progress(sent);
            Ok::<Bytes, std::io::Error>(piece)
        },
    );
    reqwest::Body::wrap_stream(stream)
}

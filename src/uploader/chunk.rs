// 上传分片规划
//
// 分片规则：
// - 文件 <= 100MB：无需分片，整个文件作为单一分片
// - 文件 > 100MB：按每 100MB 一个分片估算目标分片数，分片大小限制在 5MB-64MB
// - 服务器返回推荐分片大小时优先使用推荐值（不低于 1MB）
//
// 规划过程是纯函数：不做 I/O，分片数据是内存文件的零拷贝切片

use bytes::Bytes;
use std::ops::Range;
use tracing::debug;

/// 单分片阈值: 100MB（不超过该大小的文件不分片）
pub const SINGLE_CHUNK_THRESHOLD: u64 = 100 * 1024 * 1024;

/// 最小分片大小: 5MB
///
/// 按 100MB 估算分片数时结果总在 50MB 以上，下限只在估算规则调整时生效
pub const MIN_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// 最大分片大小: 64MB
pub const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// 推荐分片大小下限: 1MB（过小的推荐值会产生海量分片）
pub const MIN_RECOMMENDED_CHUNK_SIZE: u64 = 1024 * 1024;

/// 决定分片大小
///
/// # 参数
/// * `file_size` - 文件大小
/// * `recommended` - 服务器推荐的分片大小（可选，0 视为未提供，低于 1MB 按 1MB 处理）
///
/// # 返回
/// 分片大小（小文件返回文件大小本身）
pub fn decide_chunk_size(file_size: u64, recommended: Option<u64>) -> u64 {
    if file_size <= SINGLE_CHUNK_THRESHOLD {
        return file_size;
    }

    if let Some(size) = recommended.filter(|s| *s > 0) {
        return size.max(MIN_RECOMMENDED_CHUNK_SIZE);
    }

    let target_chunks = file_size.div_ceil(SINGLE_CHUNK_THRESHOLD);
    (file_size / target_chunks).clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

/// 分片描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// 分片索引
    pub index: usize,
    /// 起始偏移（包含）
    pub start: u64,
    /// 结束偏移（不包含）
    pub end: u64,
    /// 分片数据
    pub payload: Bytes,
}

impl ChunkDescriptor {
    /// 分片大小
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// 字节范围
    pub fn range(&self) -> Range<u64> {
        self.start..self.end
    }
}

/// 规划分片
///
/// 从偏移 0 开始按 `chunk_size` 步进切分，最后一个分片为剩余部分。
/// 空文件得到一个空分片；`chunk_size` 为 0 时整个文件作为一个分片。
pub fn plan_chunks(file: &Bytes, chunk_size: u64) -> Vec<ChunkDescriptor> {
    let total_size = file.len() as u64;

    if total_size == 0 || chunk_size == 0 || chunk_size >= total_size {
        return vec![ChunkDescriptor {
            index: 0,
            start: 0,
            end: total_size,
            payload: file.clone(),
        }];
    }

    let mut chunks = Vec::with_capacity(total_size.div_ceil(chunk_size) as usize);
    let mut offset = 0u64;
    let mut index = 0;

    while offset < total_size {
        let end = std::cmp::min(offset + chunk_size, total_size);
        chunks.push(ChunkDescriptor {
            index,
            start: offset,
            end,
            payload: file.slice(offset as usize..end as usize),
        });
        offset = end;
        index += 1;
    }

    debug!(
        "规划分片: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
        total_size,
        chunk_size,
        chunks.len()
    );

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MB: u64 = 1024 * 1024;

    /// 构造指定大小的内存文件（内容为偏移的低 8 位，便于校验切片位置）
    fn file_of(size: u64) -> Bytes {
        Bytes::from((0..size).map(|i| i as u8).collect::<Vec<u8>>())
    }

    #[test]
    fn test_small_file_single_chunk() {
        // 50MB 文件不分片
        assert_eq!(decide_chunk_size(50 * MB, None), 50 * MB);
        assert_eq!(decide_chunk_size(SINGLE_CHUNK_THRESHOLD, None), SINGLE_CHUNK_THRESHOLD);
        // 推荐值不影响小文件
        assert_eq!(decide_chunk_size(50 * MB, Some(8 * MB)), 50 * MB);
    }

    #[test]
    fn test_large_file_clamped() {
        // 250MB 估算 3 个分片，约 83MB，限制到最大 64MB
        assert_eq!(decide_chunk_size(250 * MB, None), 64 * MB);
        // 刚超过阈值：估算 2 个分片，约 50MB，在范围内
        assert_eq!(decide_chunk_size(100 * MB + 2, None), 50 * MB + 1);
        assert_eq!(decide_chunk_size(20 * 1024 * MB, None), 64 * MB);
    }

    #[test]
    fn test_recommended_size_takes_precedence() {
        assert_eq!(decide_chunk_size(250 * MB, Some(64 * MB)), 64 * MB);
        assert_eq!(decide_chunk_size(250 * MB, Some(MB)), MB);
        // 过小的推荐值提升到下限
        assert_eq!(decide_chunk_size(200 * MB, Some(1)), MIN_RECOMMENDED_CHUNK_SIZE);
        assert_eq!(decide_chunk_size(200 * MB, Some(4096)), MB);
        // 0 视为未提供
        assert_eq!(decide_chunk_size(250 * MB, Some(0)), 64 * MB);
    }

    #[test]
    fn test_plan_250mb_with_64mb_chunks() {
        let file = Bytes::from(vec![0u8; (250 * MB) as usize]);
        let chunk_size = decide_chunk_size(file.len() as u64, None);
        assert_eq!(chunk_size, 64 * MB);
        let chunks = plan_chunks(&file, chunk_size);

        assert_eq!(chunks.len(), 4);
        let sizes: Vec<u64> = chunks.iter().map(|c| c.size()).collect();
        assert_eq!(sizes, vec![64 * MB, 64 * MB, 64 * MB, 58 * MB]);
        assert_eq!(chunks[3].range(), (192 * MB)..(250 * MB));
    }

    #[test]
    fn test_plan_50mb_single_chunk() {
        let file = Bytes::from(vec![0u8; (50 * MB) as usize]);
        let chunk_size = decide_chunk_size(file.len() as u64, None);
        let chunks = plan_chunks(&file, chunk_size);

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].range(), 0..(50 * MB));
        assert_eq!(chunks[0].payload.len() as u64, 50 * MB);
    }

    #[test]
    fn test_empty_file() {
        let chunks = plan_chunks(&Bytes::new(), decide_chunk_size(0, None));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].range(), 0..0);
        assert!(chunks[0].payload.is_empty());
    }

    #[test]
    fn test_payload_matches_range() {
        let file = file_of(1000);
        let chunks = plan_chunks(&file, 300);

        assert_eq!(chunks.len(), 4);
        for chunk in &chunks {
            assert_eq!(
                chunk.payload,
                file.slice(chunk.start as usize..chunk.end as usize)
            );
        }
        assert_eq!(chunks[3].size(), 100);
    }

    proptest! {
        #[test]
        fn props_chunk_size_within_bounds(size in (SINGLE_CHUNK_THRESHOLD + 1)..(1u64 << 42)) {
            let chunk_size = decide_chunk_size(size, None);
            prop_assert!(chunk_size >= MIN_CHUNK_SIZE);
            prop_assert!(chunk_size <= MAX_CHUNK_SIZE);
        }

        #[test]
        fn props_recommended_size_bounds_chunk_count(
            size in (SINGLE_CHUNK_THRESHOLD + 1)..(1u64 << 36),
            recommended in 1u64..(128 * MB),
        ) {
            let chunk_size = decide_chunk_size(size, Some(recommended));
            prop_assert!(chunk_size >= MIN_RECOMMENDED_CHUNK_SIZE);
            prop_assert!(size.div_ceil(chunk_size) <= size.div_ceil(MIN_RECOMMENDED_CHUNK_SIZE));
        }

        #[test]
        fn props_single_chunk_shortcut(size in 0u64..=SINGLE_CHUNK_THRESHOLD) {
            prop_assert_eq!(decide_chunk_size(size, None), size);
        }

        #[test]
        fn props_plan_is_deterministic_and_covers_file(
            size in 0u64..20_000,
            chunk_size in 1u64..5_000,
        ) {
            let file = file_of(size);
            let first = plan_chunks(&file, chunk_size);
            let second = plan_chunks(&file, chunk_size);
            prop_assert_eq!(&first, &second);

            // 连续、无重叠、索引为 0..n-1，并集为 [0, size)
            let mut expected_start = 0u64;
            for (i, chunk) in first.iter().enumerate() {
                prop_assert_eq!(chunk.index, i);
                prop_assert_eq!(chunk.start, expected_start);
                prop_assert!(chunk.end >= chunk.start);
                prop_assert_eq!(chunk.payload.len() as u64, chunk.size());
                expected_start = chunk.end;
            }
            prop_assert_eq!(expected_start, size);
        }
    }
}

use crate::error::{Result, TransferError};
use serde::Serialize;
use std::ops::Range;
use tracing::{debug, info};

/// 默认分片大小: 25MB
pub const DEFAULT_CHUNK_SIZE: u64 = 25 * 1024 * 1024;

/// 默认分片上传阈值: 25MB（小于阈值直接单次 PUT）
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 25 * 1024 * 1024;

/// S3 单次分片上传最多 10000 个分片
pub const MAX_UPLOAD_PARTS: usize = 10_000;

/// 单个任务最多分片数（5 TiB / 5 MiB）
pub const MAX_PLAN_CHUNKS: u64 = 1 << 20;

/// 分片状态
///
/// 只允许前进：Pending -> InFlight -> {Completed | Failed -> InFlight（重试）}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    Pending,
    InFlight,
    Completed,
    Failed,
}

/// 分片信息
#[derive(Debug, Clone)]
pub struct Chunk {
    /// 分片索引
    pub index: usize,
    /// 字节范围
    pub range: Range<u64>,
    state: ChunkState,
    /// 已发起的请求次数
    attempts: u32,
}

impl Chunk {
    pub fn new(index: usize, range: Range<u64>) -> Self {
        Self {
            index,
            range,
            state: ChunkState::Pending,
            attempts: 0,
        }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn offset(&self) -> u64 {
        self.range.start
    }

    pub fn state(&self) -> ChunkState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// 重试次数（首次请求不计）
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    /// HTTP Range 头（闭区间）
    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.range.start, self.range.end - 1)
    }

    fn transition(&mut self, next: ChunkState) -> Result<()> {
        let allowed = matches!(
            (self.state, next),
            (ChunkState::Pending, ChunkState::InFlight)
                | (ChunkState::InFlight, ChunkState::Completed)
                | (ChunkState::InFlight, ChunkState::Failed)
                | (ChunkState::Failed, ChunkState::InFlight)
        );
        if !allowed {
            return Err(TransferError::Internal(format!(
                "分片 #{} 非法状态转换: {:?} -> {:?}",
                self.index, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// 开始一次请求，返回本次是第几次尝试
    pub fn begin_attempt(&mut self) -> Result<u32> {
        self.transition(ChunkState::InFlight)?;
        self.attempts += 1;
        Ok(self.attempts)
    }

    pub fn complete(&mut self) -> Result<()> {
        self.transition(ChunkState::Completed)
    }

    pub fn fail(&mut self) -> Result<()> {
        self.transition(ChunkState::Failed)
    }
}

/// 计算分片
///
/// 返回连续、互不重叠、覆盖 [0, total_size) 的分片序列。
/// 空对象返回单个空分片 `0..0`。
pub fn plan_chunks(total_size: u64, chunk_size: u64) -> Result<Vec<Chunk>> {
    if chunk_size == 0 {
        return Err(TransferError::invalid_config("分片大小必须大于 0"));
    }

    if total_size == 0 {
        return Ok(vec![Chunk::new(0, 0..0)]);
    }

    let count = total_size.div_ceil(chunk_size);
    if count > MAX_PLAN_CHUNKS {
        return Err(TransferError::invalid_config(format!(
            "分片数量 {} 超过上限 {}，请增大分片大小",
            count, MAX_PLAN_CHUNKS
        )));
    }

    let mut chunks = Vec::with_capacity(count as usize);
    let mut offset = 0u64;
    let mut index = 0;

    while offset < total_size {
        let end = std::cmp::min(offset.saturating_add(chunk_size), total_size);
        chunks.push(Chunk::new(index, offset..end));
        offset = end;
        index += 1;
    }

    Ok(chunks)
}

/// 是否使用分片上传
///
/// 对象达到阈值且会被切成多个分片时才走 multipart，否则单次 PUT
pub fn use_multipart(total_size: u64, multipart_threshold: u64, chunk_size: u64) -> bool {
    total_size >= multipart_threshold && total_size > chunk_size
}

/// 分片管理器
#[derive(Debug)]
pub struct ChunkManager {
    /// 所有分片
    chunks: Vec<Chunk>,
    /// 文件总大小
    total_size: u64,
    /// 分片大小
    chunk_size: u64,
}

impl ChunkManager {
    /// 创建新的分片管理器
    pub fn new(total_size: u64, chunk_size: u64) -> Result<Self> {
        let chunks = plan_chunks(total_size, chunk_size)?;
        info!(
            "创建分片管理器: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
            total_size,
            chunk_size,
            chunks.len()
        );
        Ok(Self {
            chunks,
            total_size,
            chunk_size,
        })
    }

    /// 创建分片上传计划
    ///
    /// 检查分片数量上限；除最后一个分片外，分片不能小于 `min_part_size`
    pub fn for_upload(total_size: u64, chunk_size: u64, min_part_size: u64) -> Result<Self> {
        if chunk_size > 0 {
            let parts = total_size.div_ceil(chunk_size);
            if parts > MAX_UPLOAD_PARTS as u64 {
                return Err(TransferError::invalid_config(format!(
                    "分片数量 {} 超过上限 {}，请增大分片大小",
                    parts, MAX_UPLOAD_PARTS
                )));
            }
            if parts > 1 && chunk_size < min_part_size {
                return Err(TransferError::invalid_config(format!(
                    "分片大小 {} bytes 小于分片上传下限 {} bytes",
                    chunk_size, min_part_size
                )));
            }
        }
        Self::new(total_size, chunk_size)
    }

    /// 单一分片（不分片传输）
    pub fn single(total_size: u64) -> Self {
        debug!("单一分片计划: 文件大小={} bytes", total_size);
        Self {
            chunks: vec![Chunk::new(0, 0..total_size)],
            total_size,
            chunk_size: total_size.max(1),
        }
    }

    /// 获取所有分片
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn get(&self, index: usize) -> Option<&Chunk> {
        self.chunks.get(index)
    }

    fn chunk_mut(&mut self, index: usize) -> Result<&mut Chunk> {
        self.chunks
            .get_mut(index)
            .ok_or_else(|| TransferError::Internal(format!("分片 #{} 不存在", index)))
    }

    /// 获取分片数量
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// 标记分片开始请求，返回本次尝试序号
    pub fn begin_attempt(&mut self, index: usize) -> Result<u32> {
        self.chunk_mut(index)?.begin_attempt()
    }

    /// 标记分片为已完成
    pub fn mark_completed(&mut self, index: usize) -> Result<()> {
        self.chunk_mut(index)?.complete()
    }

    /// 标记分片本次请求失败
    pub fn mark_failed(&mut self, index: usize) -> Result<()> {
        self.chunk_mut(index)?.fail()
    }

    /// 获取已完成的分片数量
    pub fn completed_count(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.state == ChunkState::Completed)
            .count()
    }

    /// 获取已完成的字节数
    pub fn completed_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| c.state == ChunkState::Completed)
            .map(|c| c.size())
            .sum()
    }

    /// 计算进度
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return if self.is_completed() { 100.0 } else { 0.0 };
        }
        (self.completed_bytes() as f64 / self.total_size as f64) * 100.0
    }

    /// 是否全部完成
    pub fn is_completed(&self) -> bool {
        self.chunks.iter().all(|c| c.state == ChunkState::Completed)
    }

    /// 每个分片的重试次数（按索引）
    pub fn retry_counts(&self) -> Vec<u32> {
        self.chunks.iter().map(|c| c.retries()).collect()
    }
}

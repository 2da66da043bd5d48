// 传输组装
//
// 下载：记录已写入的分片，所有分片写入后才算完成
// 上传：收集分片 ETag，按索引升序生成 complete 请求的分片列表

use crate::error::{Result, TransferError};
use crate::store::CompletedPart;
use crate::transfer::chunk::Chunk;
use bit_set::BitSet;
use std::collections::BTreeMap;

/// 单个分片的上传结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartResult {
    pub index: usize,
    pub etag: String,
    pub size: u64,
}

impl PartResult {
    /// 线上分片号（从 1 开始）
    pub fn part_number(&self) -> u32 {
        self.index as u32 + 1
    }
}

/// 下载组装器
#[derive(Debug)]
pub struct DownloadAssembler {
    /// 每个分片的计划长度
    expected: Vec<u64>,
    written: BitSet,
    written_bytes: u64,
}

impl DownloadAssembler {
    pub fn new(chunks: &[Chunk]) -> Self {
        Self {
            expected: chunks.iter().map(|c| c.size()).collect(),
            written: BitSet::with_capacity(chunks.len()),
            written_bytes: 0,
        }
    }

    /// 检查收到的分片长度
    pub fn check_length(chunk: &Chunk, received: usize) -> Result<()> {
        if received as u64 != chunk.size() {
            return Err(TransferError::PartialWrite(format!(
                "分片 #{} 长度不匹配: 期望 {} bytes, 收到 {} bytes",
                chunk.index,
                chunk.size(),
                received
            )));
        }
        Ok(())
    }

    /// 记录分片已写入目标
    pub fn record(&mut self, index: usize, written: u64) -> Result<()> {
        let expected = *self
            .expected
            .get(index)
            .ok_or_else(|| TransferError::Internal(format!("分片 #{} 不在计划内", index)))?;
        if written != expected {
            return Err(TransferError::PartialWrite(format!(
                "分片 #{} 写入 {} bytes, 计划 {} bytes",
                index, written, expected
            )));
        }
        if !self.written.insert(index) {
            return Err(TransferError::Internal(format!("分片 #{} 重复写入", index)));
        }
        self.written_bytes += written;
        Ok(())
    }

    pub fn written_bytes(&self) -> u64 {
        self.written_bytes
    }

    pub fn is_complete(&self) -> bool {
        self.written.len() == self.expected.len()
    }

    /// 所有分片写入后才能结束
    pub fn finish(&self) -> Result<u64> {
        if !self.is_complete() {
            let missing: Vec<usize> = (0..self.expected.len())
                .filter(|i| !self.written.contains(*i))
                .collect();
            return Err(TransferError::PartialWrite(format!(
                "缺少 {} 个分片: {:?}",
                missing.len(),
                missing
            )));
        }
        Ok(self.written_bytes)
    }
}

/// 上传组装器
#[derive(Debug)]
pub struct UploadAssembler {
    chunk_count: usize,
    parts: BTreeMap<usize, PartResult>,
}

impl UploadAssembler {
    pub fn new(chunk_count: usize) -> Self {
        Self {
            chunk_count,
            parts: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, part: PartResult) -> Result<()> {
        if part.index >= self.chunk_count {
            return Err(TransferError::Internal(format!(
                "分片 #{} 超出计划范围 (共 {} 个)",
                part.index, self.chunk_count
            )));
        }
        if self.parts.contains_key(&part.index) {
            return Err(TransferError::Internal(format!("分片 #{} 重复完成", part.index)));
        }
        self.parts.insert(part.index, part);
        Ok(())
    }

    pub fn completed(&self) -> usize {
        self.parts.len()
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.parts.values().map(|p| p.size).sum()
    }

    /// 生成 complete 请求的分片列表
    ///
    /// 只有索引恰好为 0..N-1 时才返回
    pub fn completed_parts(&self) -> Result<Vec<CompletedPart>> {
        let contiguous = self.parts.len() == self.chunk_count
            && self.parts.keys().enumerate().all(|(i, index)| i == *index);
        if !contiguous {
            return Err(TransferError::Internal(format!(
                "分片不完整: 已完成 {}/{}",
                self.parts.len(),
                self.chunk_count
            )));
        }

        Ok(self
            .parts
            .values()
            .map(|p| CompletedPart {
                part_number: p.part_number(),
                etag: p.etag.clone(),
            })
            .collect())
    }
}

// 上传数据源与下载目标
//
// 文件读写在 spawn_blocking 中执行，每次打开独立句柄，按偏移读写互不干扰

use crate::error::{Result, TransferError};
use parking_lot::Mutex;
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 上传数据源
#[derive(Debug, Clone)]
pub enum UploadSource {
    File(PathBuf),
    Memory(Arc<Vec<u8>>),
}

impl UploadSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        UploadSource::File(path.into())
    }

    pub fn memory(data: Vec<u8>) -> Self {
        UploadSource::Memory(Arc::new(data))
    }

    /// 数据总大小
    pub async fn size(&self) -> Result<u64> {
        match self {
            UploadSource::File(path) => {
                let metadata = tokio::fs::metadata(path).await?;
                if !metadata.is_file() {
                    return Err(TransferError::invalid_config(format!(
                        "上传源不是文件: {:?}",
                        path
                    )));
                }
                Ok(metadata.len())
            }
            UploadSource::Memory(data) => Ok(data.len() as u64),
        }
    }

    /// 读取字节范围
    pub async fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>> {
        match self {
            UploadSource::File(path) => {
                let path = path.clone();
                tokio::task::spawn_blocking(move || read_file_range(&path, range))
                    .await
                    .map_err(|e| TransferError::Internal(format!("读取任务异常: {}", e)))?
            }
            UploadSource::Memory(data) => {
                let end = range.end as usize;
                if end > data.len() {
                    return Err(TransferError::Internal(format!(
                        "读取范围越界: {:?}, 数据大小 {}",
                        range,
                        data.len()
                    )));
                }
                Ok(data[range.start as usize..end].to_vec())
            }
        }
    }
}

fn read_file_range(path: &Path, range: Range<u64>) -> Result<Vec<u8>> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(range.start))?;
    let mut buffer = vec![0u8; (range.end - range.start) as usize];
    file.read_exact(&mut buffer)?;
    Ok(buffer)
}

/// 下载目标
#[derive(Debug, Clone)]
pub enum DownloadSink {
    File(PathBuf),
    Memory(Arc<Mutex<Vec<u8>>>),
}

impl DownloadSink {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        DownloadSink::File(path.into())
    }

    /// 内存目标，返回共享缓冲区
    pub fn memory() -> (Self, Arc<Mutex<Vec<u8>>>) {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        (DownloadSink::Memory(Arc::clone(&buffer)), buffer)
    }

    /// 预分配目标空间
    pub async fn prepare(&self, total_size: u64) -> Result<()> {
        match self {
            DownloadSink::File(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        tokio::fs::create_dir_all(parent).await.map_err(|e| {
                            TransferError::PartialWrite(format!(
                                "创建目录失败: {:?}, 错误: {}",
                                parent, e
                            ))
                        })?;
                    }
                }
                let file = tokio::fs::File::create(path).await.map_err(|e| {
                    TransferError::PartialWrite(format!("创建文件失败: {:?}, 错误: {}", path, e))
                })?;
                file.set_len(total_size).await.map_err(|e| {
                    TransferError::PartialWrite(format!(
                        "预分配文件失败: {:?}, 大小: {} bytes, 错误: {}",
                        path, total_size, e
                    ))
                })?;
                info!("预分配文件: {:?}, 大小: {} bytes", path, total_size);
                Ok(())
            }
            DownloadSink::Memory(buffer) => {
                let mut buffer = buffer.lock();
                buffer.clear();
                buffer.resize(total_size as usize, 0);
                Ok(())
            }
        }
    }

    /// 在偏移处写入
    pub async fn write_at(&self, offset: u64, data: Vec<u8>) -> Result<()> {
        match self {
            DownloadSink::File(path) => {
                let path = path.clone();
                tokio::task::spawn_blocking(move || write_file_at(&path, offset, &data))
                    .await
                    .map_err(|e| TransferError::Internal(format!("写入任务异常: {}", e)))?
            }
            DownloadSink::Memory(buffer) => {
                let mut buffer = buffer.lock();
                let start = offset as usize;
                let end = start + data.len();
                if end > buffer.len() {
                    return Err(TransferError::PartialWrite(format!(
                        "写入范围越界: {}..{}, 目标大小 {}",
                        start,
                        end,
                        buffer.len()
                    )));
                }
                buffer[start..end].copy_from_slice(&data);
                Ok(())
            }
        }
    }

    /// 校验目标大小
    pub async fn verify(&self, expected: u64) -> Result<()> {
        let actual = match self {
            DownloadSink::File(path) => tokio::fs::metadata(path).await?.len(),
            DownloadSink::Memory(buffer) => buffer.lock().len() as u64,
        };
        if actual != expected {
            return Err(TransferError::PartialWrite(format!(
                "文件大小不匹配: 期望 {} bytes, 实际 {} bytes",
                expected, actual
            )));
        }
        debug!("目标大小校验通过: {} bytes", actual);
        Ok(())
    }

    /// 删除不完整的下载结果
    pub async fn discard(&self) {
        match self {
            DownloadSink::File(path) => match tokio::fs::remove_file(path).await {
                Ok(()) => info!("已删除不完整文件: {:?}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("删除不完整文件失败: {:?}, 错误: {}", path, e),
            },
            DownloadSink::Memory(buffer) => buffer.lock().clear(),
        }
    }
}

fn write_file_at(path: &Path, offset: u64, data: &[u8]) -> Result<()> {
    let write = || -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new().write(true).open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)
    };
    write().map_err(|e| {
        TransferError::PartialWrite(format!(
            "写入失败: {:?}, 偏移 {}, {} bytes, 错误: {}",
            path,
            offset,
            data.len(),
            e
        ))
    })
}

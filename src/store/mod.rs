// 对象存储接口
//
// 传输引擎只依赖 ObjectStore trait：
// - S3Client：S3 REST 接口（SigV4 签名）
// - InMemoryStore：内存实现，支持故障注入，用于测试

pub mod http;
pub mod memory;
pub mod sigv4;

pub use http::{build_http_client, S3Client};
pub use memory::{FaultRule, InMemoryStore, StoreCall, StoreOp};
pub use sigv4::{Credentials, SigV4Signer};

use crate::error::Result;
use async_trait::async_trait;
use std::ops::Range;

/// S3 分片最小大小（最后一个分片除外）
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// 对象元信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
    pub etag: Option<String>,
}

/// 已上传分片（complete-multipart 的输入）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    /// 线上分片号（从 1 开始）
    pub part_number: u32,
    pub etag: String,
}

/// 对象存储操作
///
/// 实现方负责把失败归类为 TransientTransport / PermanentRequest
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// 获取对象大小
    async fn head_object(&self, key: &str) -> Result<ObjectMeta>;

    /// 单次上传整个对象，返回 ETag
    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<String>;

    /// 初始化分片上传，返回 upload_id
    async fn create_multipart_upload(&self, key: &str) -> Result<String>;

    /// 上传分片，返回 ETag
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Vec<u8>,
    ) -> Result<String>;

    /// 完成分片上传，parts 必须按分片号升序
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<String>;

    /// 取消分片上传，释放已上传分片
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()>;

    /// 读取对象的字节范围 [start, end)
    async fn get_object_range(&self, key: &str, range: Range<u64>) -> Result<Vec<u8>>;

    /// 删除对象（对象不存在时也返回成功）
    async fn delete_object(&self, key: &str) -> Result<()>;

    /// 创建桶（桶已归自己所有时返回成功）
    async fn create_bucket(&self) -> Result<()>;

    /// 删除空桶
    async fn delete_bucket(&self) -> Result<()>;

    /// 开启或关闭传输加速
    async fn put_bucket_accelerate(&self, enabled: bool) -> Result<()>;

    /// 分片上传时非最后分片的最小大小
    fn min_part_size(&self) -> u64 {
        MIN_PART_SIZE
    }
}

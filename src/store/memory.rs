// 内存对象存储
//
// 用于测试传输引擎：
// - 按操作/分片号注入可重试或不可重试故障
// - 模拟请求延迟
// - 记录同时进行中请求数的峰值
// - 记录调用顺序
// - 可按 S3 规则检查分片最小大小

use super::{CompletedPart, ObjectMeta, ObjectStore};
use crate::error::{RequestErrorKind, Result, TransferError};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// 存储操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Head,
    Put,
    Create,
    UploadPart,
    Complete,
    Abort,
    GetRange,
    DeleteObject,
    CreateBucket,
    DeleteBucket,
    PutAccelerate,
}

/// 调用记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Head(String),
    Put(String),
    Create(String),
    UploadPart(u32),
    Complete(Vec<u32>),
    Abort(String),
    GetRange(Range<u64>),
    DeleteObject(String),
    CreateBucket,
    DeleteBucket,
    PutAccelerate(bool),
}

/// 故障规则
///
/// `target` 对 UploadPart 匹配分片号，对 GetRange 匹配范围起始偏移，None 匹配所有请求
#[derive(Debug, Clone)]
pub struct FaultRule {
    pub op: StoreOp,
    pub target: Option<u64>,
    /// 剩余触发次数
    pub times: u32,
    pub kind: RequestErrorKind,
    pub status: Option<u16>,
}

impl FaultRule {
    /// 可重试的 503 限流故障
    pub fn throttle(op: StoreOp, target: Option<u64>, times: u32) -> Self {
        Self {
            op,
            target,
            times,
            kind: RequestErrorKind::Throttled,
            status: Some(503),
        }
    }

    /// 可重试的网络故障
    pub fn network(op: StoreOp, target: Option<u64>, times: u32) -> Self {
        Self {
            op,
            target,
            times,
            kind: RequestErrorKind::Network,
            status: None,
        }
    }

    /// 不可重试的 403 故障
    pub fn forbidden(op: StoreOp, target: Option<u64>) -> Self {
        Self {
            op,
            target,
            times: u32::MAX,
            kind: RequestErrorKind::Forbidden,
            status: Some(403),
        }
    }
}

#[derive(Debug)]
struct PendingUpload {
    key: String,
    parts: BTreeMap<u32, (String, Vec<u8>)>,
}

/// 内存对象存储
#[derive(Debug, Default)]
pub struct InMemoryStore {
    objects: DashMap<String, (String, Arc<Vec<u8>>)>,
    uploads: DashMap<String, PendingUpload>,
    faults: Mutex<Vec<FaultRule>>,
    calls: Mutex<Vec<StoreCall>>,
    latency: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    /// 0 表示不检查
    min_part_size: u64,
    bucket_created: AtomicBool,
    accelerate: AtomicBool,
}

/// 请求结束（包括被取消）时减少进行中计数
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置数据请求（put / upload_part / get_range）的模拟延迟
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = latency;
        self
    }

    /// 按 S3 规则检查非最后分片的最小大小
    pub fn with_min_part_size(mut self, min_part_size: u64) -> Self {
        self.min_part_size = min_part_size;
        self
    }

    pub fn insert_object(&self, key: &str, data: Vec<u8>) {
        let etag = format!("\"{:x}\"", md5::compute(&data));
        self.objects.insert(key.to_string(), (etag, Arc::new(data)));
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.get(key).map(|entry| entry.1.as_ref().clone())
    }

    pub fn inject(&self, rule: FaultRule) {
        self.faults.lock().push(rule);
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().clone()
    }

    /// 同时进行中的数据请求峰值
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// 尚未完成或取消的分片上传数量
    pub fn pending_uploads(&self) -> usize {
        self.uploads.len()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn bucket_created(&self) -> bool {
        self.bucket_created.load(Ordering::SeqCst)
    }

    pub fn accelerate_enabled(&self) -> bool {
        self.accelerate.load(Ordering::SeqCst)
    }

    fn record(&self, call: StoreCall) {
        self.calls.lock().push(call);
    }

    fn check_fault(&self, op: StoreOp, target: Option<u64>) -> Result<()> {
        let mut faults = self.faults.lock();
        let hit = faults.iter_mut().find(|rule| {
            rule.op == op
                && rule.times > 0
                && (rule.target.is_none() || rule.target == target)
        });

        match hit {
            Some(rule) => {
                rule.times -= 1;
                debug!("注入故障: op={:?}, target={:?}, kind={:?}", op, target, rule.kind);
                Err(TransferError::request(
                    rule.kind,
                    rule.status,
                    format!("injected {:?} fault", rule.kind),
                ))
            }
            None => Ok(()),
        }
    }

    async fn data_request(&self) -> InFlightGuard<'_> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let guard = InFlightGuard(&self.in_flight);

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        guard
    }

    fn not_found(what: &str) -> TransferError {
        TransferError::request(RequestErrorKind::NotFound, Some(404), what.to_string())
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn head_object(&self, key: &str) -> Result<ObjectMeta> {
        self.record(StoreCall::Head(key.to_string()));
        self.check_fault(StoreOp::Head, None)?;

        let entry = self.objects.get(key).ok_or_else(|| Self::not_found("NoSuchKey"))?;
        Ok(ObjectMeta {
            size: entry.1.len() as u64,
            etag: Some(entry.0.clone()),
        })
    }

    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<String> {
        self.record(StoreCall::Put(key.to_string()));
        let _guard = self.data_request().await;
        self.check_fault(StoreOp::Put, None)?;

        let etag = format!("\"{:x}\"", md5::compute(&body));
        self.objects
            .insert(key.to_string(), (etag.clone(), Arc::new(body)));
        Ok(etag)
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String> {
        self.record(StoreCall::Create(key.to_string()));
        self.check_fault(StoreOp::Create, None)?;

        let upload_id = Uuid::new_v4().to_string();
        self.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Vec<u8>,
    ) -> Result<String> {
        self.record(StoreCall::UploadPart(part_number));
        let _guard = self.data_request().await;
        self.check_fault(StoreOp::UploadPart, Some(part_number as u64))?;

        let mut upload = self
            .uploads
            .get_mut(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| Self::not_found("NoSuchUpload"))?;

        let etag = format!("\"{:x}\"", md5::compute(&body));
        upload.parts.insert(part_number, (etag.clone(), body));
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<String> {
        self.record(StoreCall::Complete(
            parts.iter().map(|p| p.part_number).collect(),
        ));
        self.check_fault(StoreOp::Complete, None)?;

        let invalid = |msg: &str| {
            TransferError::request(RequestErrorKind::BadRequest, Some(400), msg.to_string())
        };

        // 校验失败时保留上传，与 S3 一致
        let (data, digests) = {
            let upload = self
                .uploads
                .get(upload_id)
                .filter(|u| u.key == key)
                .ok_or_else(|| Self::not_found("NoSuchUpload"))?;

            if parts.is_empty()
                || parts.windows(2).any(|w| w[0].part_number >= w[1].part_number)
            {
                return Err(invalid("InvalidPartOrder"));
            }

            let mut data = Vec::new();
            let mut digests = Vec::with_capacity(parts.len() * 16);
            for (i, part) in parts.iter().enumerate() {
                let (etag, bytes) = upload
                    .parts
                    .get(&part.part_number)
                    .ok_or_else(|| invalid("InvalidPart"))?;
                if *etag != part.etag {
                    return Err(invalid("InvalidPart"));
                }
                if i + 1 < parts.len() && (bytes.len() as u64) < self.min_part_size {
                    return Err(invalid("EntityTooSmall"));
                }
                data.extend_from_slice(bytes);
                digests.extend_from_slice(&md5::compute(bytes).0);
            }
            (data, digests)
        };
        self.uploads.remove(upload_id);

        // 与 S3 一致：分片 MD5 拼接后再取 MD5，附加分片数
        let etag = format!("\"{:x}-{}\"", md5::compute(&digests), parts.len());
        self.objects
            .insert(key.to_string(), (etag.clone(), Arc::new(data)));
        Ok(etag)
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> Result<()> {
        self.record(StoreCall::Abort(upload_id.to_string()));
        self.check_fault(StoreOp::Abort, None)?;
        self.uploads.remove(upload_id);
        Ok(())
    }

    async fn get_object_range(&self, key: &str, range: Range<u64>) -> Result<Vec<u8>> {
        self.record(StoreCall::GetRange(range.clone()));
        let _guard = self.data_request().await;
        self.check_fault(StoreOp::GetRange, Some(range.start))?;

        let data = self
            .objects
            .get(key)
            .map(|entry| Arc::clone(&entry.1))
            .ok_or_else(|| Self::not_found("NoSuchKey"))?;

        let len = data.len() as u64;
        if range.start > range.end || range.start >= len.max(1) {
            return Err(TransferError::request(
                RequestErrorKind::BadRequest,
                Some(416),
                "InvalidRange",
            ));
        }
        let end = range.end.min(len);
        Ok(data[range.start as usize..end as usize].to_vec())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.record(StoreCall::DeleteObject(key.to_string()));
        self.check_fault(StoreOp::DeleteObject, None)?;
        self.objects.remove(key);
        Ok(())
    }

    async fn create_bucket(&self) -> Result<()> {
        self.record(StoreCall::CreateBucket);
        self.check_fault(StoreOp::CreateBucket, None)?;
        self.bucket_created.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_bucket(&self) -> Result<()> {
        self.record(StoreCall::DeleteBucket);
        self.check_fault(StoreOp::DeleteBucket, None)?;
        if !self.objects.is_empty() || !self.uploads.is_empty() {
            return Err(TransferError::request(
                RequestErrorKind::BadRequest,
                Some(409),
                "BucketNotEmpty",
            ));
        }
        self.bucket_created.store(false, Ordering::SeqCst);
        self.accelerate.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn put_bucket_accelerate(&self, enabled: bool) -> Result<()> {
        self.record(StoreCall::PutAccelerate(enabled));
        self.check_fault(StoreOp::PutAccelerate, None)?;
        self.accelerate.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    fn min_part_size(&self) -> u64 {
        self.min_part_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_multipart_roundtrip() {
        let store = InMemoryStore::new();
        let id = store.create_multipart_upload("k").await.unwrap();
        let e1 = store.upload_part("k", &id, 1, b"hello ".to_vec()).await.unwrap();
        let e2 = store.upload_part("k", &id, 2, b"world".to_vec()).await.unwrap();

        let parts = vec![
            CompletedPart { part_number: 1, etag: e1 },
            CompletedPart { part_number: 2, etag: e2 },
        ];
        let etag = store.complete_multipart_upload("k", &id, &parts).await.unwrap();
        assert!(etag.ends_with("-2\""));
        assert_eq!(store.object("k").unwrap(), b"hello world");
        assert_eq!(store.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_complete_rejects_unordered_parts() {
        let store = InMemoryStore::new();
        let id = store.create_multipart_upload("k").await.unwrap();
        let e1 = store.upload_part("k", &id, 1, vec![1]).await.unwrap();
        let e2 = store.upload_part("k", &id, 2, vec![2]).await.unwrap();

        let parts = vec![
            CompletedPart { part_number: 2, etag: e2 },
            CompletedPart { part_number: 1, etag: e1 },
        ];
        let err = store.complete_multipart_upload("k", &id, &parts).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::PermanentRequest { kind: RequestErrorKind::BadRequest, .. }
        ));
    }

    #[tokio::test]
    async fn test_complete_with_wrong_key_keeps_upload() {
        let store = InMemoryStore::new();
        let id = store.create_multipart_upload("k").await.unwrap();
        let e1 = store.upload_part("k", &id, 1, vec![1]).await.unwrap();
        let parts = vec![CompletedPart { part_number: 1, etag: e1 }];

        let err = store.complete_multipart_upload("other", &id, &parts).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::PermanentRequest { kind: RequestErrorKind::NotFound, .. }
        ));
        assert_eq!(store.pending_uploads(), 1);

        store.complete_multipart_upload("k", &id, &parts).await.unwrap();
        assert_eq!(store.object("k").unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_complete_rejects_small_parts() {
        let store = InMemoryStore::new().with_min_part_size(4);
        let id = store.create_multipart_upload("k").await.unwrap();
        let e1 = store.upload_part("k", &id, 1, vec![1; 3]).await.unwrap();
        let e2 = store.upload_part("k", &id, 2, vec![2; 1]).await.unwrap();

        let parts = vec![
            CompletedPart { part_number: 1, etag: e1 },
            CompletedPart { part_number: 2, etag: e2 },
        ];
        let err = store.complete_multipart_upload("k", &id, &parts).await.unwrap_err();
        assert!(err.to_string().contains("EntityTooSmall"));
        assert_eq!(store.pending_uploads(), 1);
        assert_eq!(store.min_part_size(), 4);
    }

    #[tokio::test]
    async fn test_bucket_lifecycle() {
        let store = InMemoryStore::new();
        store.create_bucket().await.unwrap();
        store.put_bucket_accelerate(true).await.unwrap();
        assert!(store.bucket_created());
        assert!(store.accelerate_enabled());

        store.insert_object("k", vec![1, 2, 3]);
        assert!(store.delete_bucket().await.is_err());

        store.delete_object("k").await.unwrap();
        // 删除不存在的对象不报错
        store.delete_object("k").await.unwrap();
        store.delete_bucket().await.unwrap();
        assert!(!store.bucket_created());
        assert_eq!(
            store.calls(),
            vec![
                StoreCall::CreateBucket,
                StoreCall::PutAccelerate(true),
                StoreCall::DeleteBucket,
                StoreCall::DeleteObject("k".to_string()),
                StoreCall::DeleteObject("k".to_string()),
                StoreCall::DeleteBucket,
            ]
        );
    }

    #[tokio::test]
    async fn test_fault_injection_counts_down() {
        let store = InMemoryStore::new();
        store.insert_object("k", vec![7; 100]);
        store.inject(FaultRule::throttle(StoreOp::GetRange, Some(50), 2));

        assert!(store.get_object_range("k", 0..50).await.is_ok());
        assert!(store.get_object_range("k", 50..100).await.unwrap_err().is_throttling());
        assert!(store.get_object_range("k", 50..100).await.is_err());
        assert_eq!(store.get_object_range("k", 50..100).await.unwrap().len(), 50);
    }

    #[tokio::test]
    async fn test_head_missing_object() {
        let store = InMemoryStore::new();
        let err = store.head_object("missing").await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(store.calls(), vec![StoreCall::Head("missing".to_string())]);
    }
}

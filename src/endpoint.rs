//! 连接端点选择
//!
//! 任务开始时根据配置一次性确定连接目标，传输过程中不切换：
//! - direct：`https://{bucket}.s3.{region}.amazonaws.com`（虚拟主机寻址），
//!   配置了自定义 endpoint 时使用路径寻址 `{endpoint}/{bucket}`
//! - accelerated：`https://{bucket}.s3-accelerate.amazonaws.com`，
//!   开启双栈时使用 `s3-accelerate.dualstack.amazonaws.com`

use crate::config::StoreConfig;
use crate::error::{Result, TransferError};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

/// 端点模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointMode {
    /// 直连区域端点
    #[default]
    Direct,
    /// 传输加速端点
    Accelerated,
}

impl fmt::Display for EndpointMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointMode::Direct => write!(f, "direct"),
            EndpointMode::Accelerated => write!(f, "accelerated"),
        }
    }
}

/// 选定的连接目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub mode: EndpointMode,
    /// 桶根地址（不含结尾 `/`）
    pub base_url: String,
    pub host: String,
    pub region: String,
    pub bucket: String,
}

impl Endpoint {
    /// 对象地址（key 按路径段编码，保留 `/`）
    pub fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, encode_key(key))
    }

    /// 对象地址中的路径部分（用于签名）
    pub fn object_path(&self, key: &str) -> String {
        let base_path = reqwest::Url::parse(&self.base_url)
            .map(|u| u.path().trim_end_matches('/').to_string())
            .unwrap_or_default();
        format!("{}/{}", base_path, encode_key(key))
    }
}

/// 按路径段 URI 编码对象 key
pub fn encode_key(key: &str) -> String {
    key.trim_start_matches('/')
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// 端点选择器
#[derive(Debug, Clone)]
pub struct EndpointSelector {
    bucket: String,
    region: String,
    custom_endpoint: Option<String>,
    dualstack: bool,
}

impl EndpointSelector {
    pub fn new(store: &StoreConfig) -> Self {
        Self {
            bucket: store.bucket.clone(),
            region: store.region.clone(),
            custom_endpoint: store.endpoint.clone(),
            dualstack: store.dualstack,
        }
    }

    /// 按模式选择端点
    pub fn select(&self, mode: EndpointMode) -> Result<Endpoint> {
        if self.bucket.is_empty() {
            return Err(TransferError::invalid_config("未配置 bucket"));
        }

        let base_url = match (mode, &self.custom_endpoint) {
            (EndpointMode::Direct, Some(custom)) => {
                format!("{}/{}", custom.trim_end_matches('/'), self.bucket)
            }
            (EndpointMode::Direct, None) => {
                if !is_virtual_host_compatible(&self.bucket) {
                    return Err(TransferError::invalid_config(format!(
                        "bucket 名称 {:?} 不支持虚拟主机寻址",
                        self.bucket
                    )));
                }
                let suffix = if self.dualstack { "dualstack." } else { "" };
                format!(
                    "https://{}.s3.{}{}.amazonaws.com",
                    self.bucket, suffix, self.region
                )
            }
            (EndpointMode::Accelerated, Some(_)) => {
                return Err(TransferError::invalid_config(
                    "自定义 endpoint 不支持传输加速",
                ));
            }
            (EndpointMode::Accelerated, None) => {
                if !is_accelerate_compatible(&self.bucket) {
                    return Err(TransferError::invalid_config(format!(
                        "bucket 名称 {:?} 不支持传输加速（需符合 DNS 命名且不含 '.'）",
                        self.bucket
                    )));
                }
                let host = if self.dualstack {
                    "s3-accelerate.dualstack.amazonaws.com"
                } else {
                    "s3-accelerate.amazonaws.com"
                };
                format!("https://{}.{}", self.bucket, host)
            }
        };

        let host = reqwest::Url::parse(&base_url)
            .ok()
            .and_then(|u| {
                u.host_str().map(|h| match u.port() {
                    Some(port) => format!("{}:{}", h, port),
                    None => h.to_string(),
                })
            })
            .ok_or_else(|| {
                TransferError::invalid_config(format!("无效的 endpoint 地址: {}", base_url))
            })?;

        info!("选择端点: mode={}, url={}", mode, base_url);

        Ok(Endpoint {
            mode,
            base_url,
            host,
            region: self.region.clone(),
            bucket: self.bucket.clone(),
        })
    }
}

/// 是否符合 DNS 命名规则（3-63 位小写字母、数字、`-`、`.`，首尾为字母或数字）
fn is_virtual_host_compatible(bucket: &str) -> bool {
    let len = bucket.len();
    if !(3..=63).contains(&len) {
        return false;
    }
    let bytes = bucket.as_bytes();
    let valid_char = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-' || *b == b'.';
    let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    bytes.iter().all(valid_char)
        && alnum(&bytes[0])
        && alnum(&bytes[len - 1])
        && !bucket.contains("..")
}

fn is_accelerate_compatible(bucket: &str) -> bool {
    is_virtual_host_compatible(bucket) && !bucket.contains('.')
}

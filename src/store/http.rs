// S3 REST 客户端
//
// 所有 worker 共用同一个 reqwest::Client（连接池），池大小不小于并发数

use super::sigv4::{SignableRequest, SigV4Signer, UNSIGNED_PAYLOAD};
use super::{CompletedPart, Credentials, ObjectMeta, ObjectStore};
use crate::config::StoreConfig;
use crate::endpoint::{encode_key, Endpoint};
use crate::error::{RequestErrorKind, Result, TransferError};
use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use reqwest::{header, Client, Method, Response, StatusCode};
use std::ops::Range;
use tracing::{debug, warn};

/// 创建共享 HTTP 客户端
pub fn build_http_client(store: &StoreConfig, pool_size: usize) -> Result<Client> {
    Client::builder()
        .pool_max_idle_per_host(pool_size.max(1))
        .connect_timeout(store.connect_timeout())
        .timeout(store.request_timeout())
        .tcp_nodelay(true)
        .build()
        .map_err(|e| TransferError::invalid_config(format!("创建 HTTP 客户端失败: {}", e)))
}

/// S3 客户端（绑定到一个已选定的端点）
#[derive(Debug, Clone)]
pub struct S3Client {
    client: Client,
    endpoint: Endpoint,
    signer: Option<SigV4Signer>,
}

impl S3Client {
    /// 创建客户端，credentials 为 None 时发送匿名请求
    pub fn new(client: Client, endpoint: Endpoint, credentials: Option<Credentials>) -> Self {
        if credentials.is_none() {
            warn!("未配置访问凭证，使用匿名请求");
        }
        let signer = credentials.map(|c| SigV4Signer::new(c, endpoint.region.clone()));
        Self {
            client,
            endpoint,
            signer,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn send(
        &self,
        method: Method,
        key: &str,
        query: &[(&str, &str)],
        headers: &[(&str, &str)],
        body: Option<Vec<u8>>,
    ) -> Result<Response> {
        let mut url = self.endpoint.object_url(key);
        if !query.is_empty() {
            url.push('?');
            url.push_str(&encode_query(query));
        }

        let mut request = self.client.request(method.clone(), &url);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        if let Some(signer) = &self.signer {
            let path = self.endpoint.object_path(key);
            let signable = SignableRequest {
                method: method.as_str(),
                host: &self.endpoint.host,
                path: &path,
                query,
                headers,
                payload_hash: UNSIGNED_PAYLOAD,
            };
            for (name, value) in signer.sign(&signable, Utc::now()) {
                request = request.header(name, value);
            }
        }

        if let Some(body) = body {
            request = request.body(body);
        }

        debug!("{} {}", method, url);
        let response = request.send().await.map_err(transport_error)?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(error_from_response(response).await)
        }
    }
}

/// 查询参数编码（与签名时的规范化顺序一致）
fn encode_query(query: &[(&str, &str)]) -> String {
    let mut pairs: Vec<String> = query
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect();
    pairs.sort();
    pairs.join("&")
}

fn transport_error(e: reqwest::Error) -> TransferError {
    if e.is_builder() {
        return TransferError::invalid_config(format!("无效请求: {}", e));
    }
    let kind = if e.is_timeout() {
        RequestErrorKind::Timeout
    } else {
        RequestErrorKind::Network
    };
    TransferError::request(kind, None, e.to_string())
}

async fn error_from_response(response: Response) -> TransferError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    error_from_body(status, &body)
}

/// 根据状态码和错误响应体归类
///
/// S3 错误码优先，无法识别时按状态码判断
fn error_from_body(status: u16, body: &str) -> TransferError {
    let code = extract_xml_tag(body, "Code");
    let kind = code
        .as_deref()
        .map(RequestErrorKind::from_s3_code)
        .filter(|k| *k != RequestErrorKind::Unknown)
        .unwrap_or_else(|| RequestErrorKind::from_status(status));

    let message = match (code, extract_xml_tag(body, "Message")) {
        (Some(code), Some(msg)) => format!("HTTP {}: {} - {}", status, code, msg),
        (Some(code), None) => format!("HTTP {}: {}", status, code),
        _ => format!("HTTP {}", status),
    };

    let status = (status != StatusCode::OK.as_u16()).then_some(status);
    TransferError::request(kind, status, message)
}

/// 提取 XML 标签内容
fn extract_xml_tag(xml: &str, tag: &str) -> Option<String> {
    let pattern = format!(r"<{}[^>]*>([^<]*)</{}>", tag, tag);
    let re = regex::Regex::new(&pattern).ok()?;
    re.captures(xml)
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn etag_of(response: &Response) -> Result<String> {
    response
        .headers()
        .get(header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .ok_or_else(|| {
            TransferError::request(RequestErrorKind::Unknown, None, "响应缺少 ETag")
        })
}

const S3_XMLNS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

/// us-east-1 不需要 LocationConstraint
fn create_bucket_body(region: &str) -> Option<String> {
    (region != "us-east-1").then(|| {
        format!(
            "<CreateBucketConfiguration xmlns=\"{}\"><LocationConstraint>{}</LocationConstraint></CreateBucketConfiguration>",
            S3_XMLNS, region
        )
    })
}

fn accelerate_body(enabled: bool) -> String {
    format!(
        "<AccelerateConfiguration xmlns=\"{}\"><Status>{}</Status></AccelerateConfiguration>",
        S3_XMLNS,
        if enabled { "Enabled" } else { "Suspended" }
    )
}

fn complete_body(parts: &[CompletedPart]) -> String {
    let mut xml = String::from("<CompleteMultipartUpload>");
    for part in parts {
        xml.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            part.part_number, part.etag
        ));
    }
    xml.push_str("</CompleteMultipartUpload>");
    xml
}

#[async_trait]
impl ObjectStore for S3Client {
    async fn head_object(&self, key: &str) -> Result<ObjectMeta> {
        let response = self.send(Method::HEAD, key, &[], &[], None).await?;

        let size = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| {
                TransferError::request(
                    RequestErrorKind::Unknown,
                    None,
                    format!("HEAD {} 响应缺少 Content-Length", encode_key(key)),
                )
            })?;

        Ok(ObjectMeta {
            size,
            etag: etag_of(&response).ok(),
        })
    }

    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<String> {
        let content_md5 =
            base64::engine::general_purpose::STANDARD.encode(md5::compute(&body).0);
        let response = self
            .send(
                Method::PUT,
                key,
                &[],
                &[("content-md5", content_md5.as_str())],
                Some(body),
            )
            .await?;
        etag_of(&response)
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String> {
        let response = self
            .send(Method::POST, key, &[("uploads", "")], &[], None)
            .await?;
        let body = response.text().await.map_err(transport_error)?;

        extract_xml_tag(&body, "UploadId").ok_or_else(|| {
            TransferError::request(
                RequestErrorKind::Unknown,
                None,
                "InitiateMultipartUpload 响应缺少 UploadId",
            )
        })
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Vec<u8>,
    ) -> Result<String> {
        let part = part_number.to_string();
        let response = self
            .send(
                Method::PUT,
                key,
                &[("partNumber", part.as_str()), ("uploadId", upload_id)],
                &[],
                Some(body),
            )
            .await?;
        etag_of(&response)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<String> {
        let response = self
            .send(
                Method::POST,
                key,
                &[("uploadId", upload_id)],
                &[("content-type", "application/xml")],
                Some(complete_body(parts).into_bytes()),
            )
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(transport_error)?;

        // 完成请求可能以 200 返回错误
        if body.contains("<Error>") {
            return Err(error_from_body(status, &body));
        }

        extract_xml_tag(&body, "ETag")
            .map(|etag| etag.replace("&quot;", "\""))
            .ok_or_else(|| {
                TransferError::request(
                    RequestErrorKind::Unknown,
                    None,
                    "CompleteMultipartUpload 响应缺少 ETag",
                )
            })
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        self.send(Method::DELETE, key, &[("uploadId", upload_id)], &[], None)
            .await?;
        Ok(())
    }

    async fn get_object_range(&self, key: &str, range: Range<u64>) -> Result<Vec<u8>> {
        if range.start >= range.end {
            return Ok(Vec::new());
        }
        let range_header = format!("bytes={}-{}", range.start, range.end - 1);
        let response = self
            .send(Method::GET, key, &[], &[("range", range_header.as_str())], None)
            .await?;

        let full_object = response.status() == StatusCode::OK;
        let bytes = response.bytes().await.map_err(transport_error)?;

        // 服务端忽略 Range 时返回整个对象
        if full_object && bytes.len() as u64 >= range.end {
            return Ok(bytes[range.start as usize..range.end as usize].to_vec());
        }
        Ok(bytes.to_vec())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.send(Method::DELETE, key, &[], &[], None).await?;
        Ok(())
    }

    async fn create_bucket(&self) -> Result<()> {
        let body = create_bucket_body(&self.endpoint.region).map(String::into_bytes);
        match self.send(Method::PUT, "", &[], &[], body).await {
            Ok(_) => Ok(()),
            Err(TransferError::PermanentRequest { message, .. })
                if message.contains("BucketAlreadyOwnedByYou") =>
            {
                debug!("桶已存在: {}", self.endpoint.bucket);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_bucket(&self) -> Result<()> {
        self.send(Method::DELETE, "", &[], &[], None).await?;
        Ok(())
    }

    async fn put_bucket_accelerate(&self, enabled: bool) -> Result<()> {
        self.send(
            Method::PUT,
            "",
            &[("accelerate", "")],
            &[("content-type", "application/xml")],
            Some(accelerate_body(enabled).into_bytes()),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointMode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// 只响应一次请求的 HTTP 服务，返回请求文本
    async fn serve_once(response: String) -> (Endpoint, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            // 读完请求头和 Content-Length 指定的请求体
            loop {
                let text = String::from_utf8_lossy(&request).to_ascii_lowercase();
                if let Some(end) = text.find("\r\n\r\n") {
                    let body_len = text[..end]
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if request.len() >= end + 4 + body_len {
                        break;
                    }
                }
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).into_owned()
        });

        let endpoint = Endpoint {
            mode: EndpointMode::Direct,
            base_url: format!("http://{}/bucket", addr),
            host: addr.to_string(),
            region: "us-east-1".to_string(),
            bucket: "bucket".to_string(),
        };
        (endpoint, handle)
    }

    fn client(endpoint: Endpoint, credentials: Option<Credentials>) -> S3Client {
        let http = build_http_client(&StoreConfig::default(), 4).unwrap();
        S3Client::new(http, endpoint, credentials)
    }

    #[test]
    fn test_error_classification() {
        let body = "<Error><Code>SlowDown</Code><Message>Reduce your request rate.</Message></Error>";
        let err = error_from_body(503, body);
        assert!(err.is_throttling());
        assert!(err.to_string().contains("SlowDown"));

        let err = error_from_body(403, "<Error><Code>AccessDenied</Code></Error>");
        assert!(matches!(
            err,
            TransferError::PermanentRequest { kind: RequestErrorKind::Forbidden, status: Some(403), .. }
        ));

        // 无响应体时按状态码判断
        assert!(error_from_body(500, "").is_transient());
        assert!(!error_from_body(404, "").is_transient());

        // 200 响应中的内部错误可重试
        let err = error_from_body(200, "<Error><Code>InternalError</Code></Error>");
        assert!(err.is_transient());
    }

    #[test]
    fn test_extract_xml_tag() {
        let xml = "<InitiateMultipartUploadResult><Bucket>b</Bucket><UploadId>abc-123</UploadId></InitiateMultipartUploadResult>";
        assert_eq!(extract_xml_tag(xml, "UploadId"), Some("abc-123".to_string()));
        assert_eq!(extract_xml_tag(xml, "Key"), None);
    }

    #[test]
    fn test_complete_body_and_query() {
        let parts = vec![
            CompletedPart { part_number: 1, etag: "\"a\"".to_string() },
            CompletedPart { part_number: 2, etag: "\"b\"".to_string() },
        ];
        assert_eq!(
            complete_body(&parts),
            "<CompleteMultipartUpload><Part><PartNumber>1</PartNumber><ETag>\"a\"</ETag></Part>\
             <Part><PartNumber>2</PartNumber><ETag>\"b\"</ETag></Part></CompleteMultipartUpload>"
        );
        assert_eq!(
            encode_query(&[("uploadId", "x/y"), ("partNumber", "3")]),
            "partNumber=3&uploadId=x%2Fy"
        );
    }

    #[tokio::test]
    async fn test_head_object_anonymous() {
        let (endpoint, server) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 1234\r\nETag: \"abc\"\r\nConnection: close\r\n\r\n"
                .to_string(),
        )
        .await;

        let meta = client(endpoint, None).head_object("dir/a b.bin").await.unwrap();
        assert_eq!(meta.size, 1234);
        assert_eq!(meta.etag.as_deref(), Some("\"abc\""));

        let request = server.await.unwrap();
        assert!(request.starts_with("HEAD /bucket/dir/a%20b.bin HTTP/1.1"));
        assert!(!request.to_ascii_lowercase().contains("authorization:"));
    }

    #[tokio::test]
    async fn test_get_range_signed() {
        let (endpoint, server) = serve_once(
            "HTTP/1.1 206 Partial Content\r\nContent-Length: 4\r\nConnection: close\r\n\r\nwxyz"
                .to_string(),
        )
        .await;

        let creds = Credentials {
            access_key_id: "AKID".to_string(),
            secret_access_key: "SECRET".to_string(),
            session_token: None,
        };
        let data = client(endpoint, Some(creds))
            .get_object_range("k", 10..14)
            .await
            .unwrap();
        assert_eq!(data, b"wxyz");

        let request = server.await.unwrap().to_ascii_lowercase();
        assert!(request.contains("range: bytes=10-13"));
        assert!(request.contains("authorization: aws4-hmac-sha256 credential=akid/"));
        assert!(request.contains("x-amz-content-sha256: unsigned-payload"));
    }

    #[test]
    fn test_bucket_bodies() {
        assert_eq!(create_bucket_body("us-east-1"), None);
        let body = create_bucket_body("eu-west-1").unwrap();
        assert!(body.contains("<LocationConstraint>eu-west-1</LocationConstraint>"));
        assert!(accelerate_body(true).contains("<Status>Enabled</Status>"));
        assert!(accelerate_body(false).contains("<Status>Suspended</Status>"));
    }

    #[tokio::test]
    async fn test_put_bucket_accelerate_request() {
        let (endpoint, server) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
        )
        .await;

        client(endpoint, None).put_bucket_accelerate(true).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("PUT /bucket/?accelerate= HTTP/1.1"));
        assert!(request.ends_with("<Status>Enabled</Status></AccelerateConfiguration>"));
    }

    #[tokio::test]
    async fn test_create_existing_bucket_succeeds() {
        let body = "<Error><Code>BucketAlreadyOwnedByYou</Code></Error>";
        let (endpoint, server) = serve_once(format!(
            "HTTP/1.1 409 Conflict\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        ))
        .await;

        client(endpoint, None).create_bucket().await.unwrap();
        assert!(server.await.unwrap().starts_with("PUT /bucket/ HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_throttled_response() {
        let body = "<Error><Code>SlowDown</Code></Error>";
        let (endpoint, server) = serve_once(format!(
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        ))
        .await;

        let err = client(endpoint, None)
            .get_object_range("k", 0..10)
            .await
            .unwrap_err();
        assert!(err.is_throttling());
        server.await.unwrap();
    }
}

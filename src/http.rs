//! HTTP 辅助工具：CORS、安全头、客户端 IP 与兜底响应。

use axum::body::Body as AxumBody;
use axum::http::{HeaderMap, HeaderValue, Method, Request, StatusCode, header};
use axum::{middleware, response::Response};
use std::net::IpAddr;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::warn;

use crate::error::ApiError;

/// 构建 CORS Layer：未配置来源时允许任意来源，否则按逗号分隔的列表放行。
pub fn build_cors_layer(cors_origins: Option<&str>) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .expose_headers([header::CONTENT_DISPOSITION]);

    let origins = cors_origins
        .unwrap_or_default()
        .split(',')
        .map(|origin| origin.trim())
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "invalid cors origin");
                None
            }
        })
        .collect::<Vec<_>>();

    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(origins))
    }
}

/// 从 `x-forwarded-for` 解析客户端 IP。
pub fn extract_forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse::<IpAddr>().ok())
}

/// 综合转发头与连接信息计算客户端 IP。
pub fn resolve_client_ip(headers: &HeaderMap, connect_ip: Option<IpAddr>) -> Option<IpAddr> {
    extract_forwarded_ip(headers).or(connect_ip)
}

/// 构造 `attachment` 形式的 Content-Disposition。
pub fn content_disposition(filename: &str) -> Result<HeaderValue, ApiError> {
    let escaped: String = filename
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    header_value(&format!("attachment; filename=\"{escaped}\""))
}

pub fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value)
        .map_err(|_| ApiError::Internal("Failed to build response headers".into()))
}

/// 添加基础安全响应头。
pub async fn add_security_headers(
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, StatusCode> {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    Ok(response)
}

/// 路由存在但方法不匹配。
pub async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

/// 未知路由。
pub async fn not_found() -> ApiError {
    ApiError::NotFound("Not found".into())
}

/// 根路径的存活提示。
pub async fn root() -> &'static str {
    "The local-ftp server is running successfully!"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_ip_takes_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("192.168.1.20, 10.0.0.1"),
        );
        assert_eq!(
            extract_forwarded_ip(&headers),
            Some("192.168.1.20".parse().expect("ip"))
        );
    }

    #[test]
    fn connect_ip_is_the_fallback() {
        let connect: IpAddr = "10.1.2.3".parse().expect("ip");
        assert_eq!(
            resolve_client_ip(&HeaderMap::new(), Some(connect)),
            Some(connect)
        );
    }

    #[test]
    fn invalid_header_value_is_an_internal_error() {
        match header_value("line\nbreak") {
            Err(ApiError::Internal(message)) => {
                assert_eq!(message, "Failed to build response headers")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn disposition_neutralises_quotes() {
        let value = content_disposition("we\"ird\\name.txt").expect("header");
        assert_eq!(value, "attachment; filename=\"we_ird_name.txt\"");
    }
}

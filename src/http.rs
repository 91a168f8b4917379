//! HTTP 辅助工具：方法分派、请求改写转发与安全头。

use axum::body::Body as AxumBody;
use axum::http::{HeaderMap, HeaderValue, Method, Request, StatusCode, Uri, header};
use axum::{middleware, response::Response};
use std::convert::Infallible;
use std::net::IpAddr;
use std::path::Path;
use tower::ServiceExt;
use tower_http::services::ServeDir;

use crate::error::ApiError;
use crate::guard::check_traversal;

/// 处理器关心的请求方法。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteMethod {
    Get,
    Head,
    Post,
    Delete,
    Other,
}

impl From<&Method> for RouteMethod {
    fn from(method: &Method) -> Self {
        match *method {
            Method::GET => RouteMethod::Get,
            Method::HEAD => RouteMethod::Head,
            Method::POST => RouteMethod::Post,
            Method::DELETE => RouteMethod::Delete,
            _ => RouteMethod::Other,
        }
    }
}

/// 去掉命名空间前缀后的请求路径。
pub fn namespace_path<'a>(path: &'a str, prefix: &str) -> &'a str {
    path.strip_prefix(prefix).unwrap_or(path)
}

/// 百分号解码请求路径并再次做穿越检查。
pub fn decode_path(raw: &str) -> Result<String, ApiError> {
    let decoded = urlencoding::decode(raw)
        .map_err(|_| ApiError::BadRequest("invalid path encoding".into()))?;
    check_traversal(&decoded)
}

/// 对文件系统得到的路径逐段做百分号编码。
pub fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// 请求体是否为 urlencoded 表单。
pub fn is_form_body(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"))
}

/// 改写请求路径（保留查询串）后交给文件服务。
pub async fn forward(
    mut req: Request<AxumBody>,
    path: &str,
    root: &Path,
) -> Result<Response, ApiError> {
    let path_and_query = match req.uri().query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    };
    let uri = Uri::builder()
        .path_and_query(path_and_query)
        .build()
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    *req.uri_mut() = uri;
    Ok(serve_tree(req, root).await)
}

/// 下游文件服务：从 `root` 提供静态文件。
pub async fn serve_tree(req: Request<AxumBody>, root: &Path) -> Response {
    let result: Result<_, Infallible> = ServeDir::new(root).oneshot(req).await;
    match result {
        Ok(response) => response.map(AxumBody::new),
        Err(never) => match never {},
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

/// 添加基础安全响应头。
pub async fn add_security_headers(
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, StatusCode> {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_FRAME_OPTIONS,
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    Ok(response)
}

//! 目录树的上传、建目录与删除处理器。

use axum::body::Body as AxumBody;
use axum::extract::multipart::Field;
use axum::extract::{Extension, Form, FromRequest, Multipart, Query};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::{RequestConfig, SiteConfig};
use crate::error::ApiError;
use crate::guard::{check_traversal, join_url_path};
use crate::http::{
    RouteMethod, decode_path, encode_path, forward, is_form_body, namespace_path,
};
use crate::storage::{remove_entry, resolve_under};

/// 目录树入口：GET/HEAD 交给文件服务，POST 上传，DELETE 删除。
pub async fn tree_entry(
    Extension(site): Extension<Arc<SiteConfig>>,
    req: Request<AxumBody>,
) -> Result<Response, ApiError> {
    let raw = check_traversal(namespace_path(req.uri().path(), &site.upload_prefix))?;
    let current = decode_path(&raw)?;

    match RouteMethod::from(req.method()) {
        RouteMethod::Get | RouteMethod::Head => {
            let config = site.for_request(req.headers())?;
            forward(req, &raw, &config.root).await
        }
        RouteMethod::Post => {
            let config = site.for_request(req.headers())?;
            let location = format!("{}{raw}", site.upload_prefix);
            let multipart = Multipart::from_request(req, &())
                .await
                .map_err(|err| ApiError::BadRequest(err.body_text()))?;
            upload(&config, &current, &location, multipart).await
        }
        RouteMethod::Delete => {
            let config = site.for_request(req.headers())?;
            let names = form_files(req).await?;
            delete(&config, &current, &names).await?;
            Ok(StatusCode::OK.into_response())
        }
        RouteMethod::Other => Err(ApiError::MethodNotAllowed),
    }
}

/// 处理 multipart 表单：`dir` 建目录，或逐个写入 `files`。
///
/// `current` 是解码后的相对目录，`location` 是它对外的 URL。
pub async fn upload(
    config: &RequestConfig,
    current: &str,
    location: &str,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut uploaded = Vec::new();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(err.body_text()))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("dir") => {
                let dir = field
                    .text()
                    .await
                    .map_err(|err| ApiError::BadRequest(err.body_text()))?;
                if dir.is_empty() {
                    continue;
                }
                if !uploaded.is_empty() {
                    return Err(ApiError::BadRequest(
                        "dir field must come before files".into(),
                    ));
                }
                return create_directory(config, current, location, &dir).await;
            }
            Some("files") => {
                let Some(file_name) = field.file_name().map(str::to_string) else {
                    continue;
                };
                if file_name.is_empty() {
                    continue;
                }
                write_part(config, current, &file_name, &mut field).await?;
                uploaded.push(join_url_path(current, &file_name));
            }
            _ => continue,
        }
    }

    if uploaded.is_empty() {
        return Err(ApiError::BadRequest("missing files".into()));
    }

    info!(upload_type = "file", paths = ?uploaded, "upload complete");
    Ok(Redirect::to(location).into_response())
}

async fn create_directory(
    config: &RequestConfig,
    current: &str,
    location: &str,
    dir: &str,
) -> Result<Response, ApiError> {
    let dir = check_traversal(dir)?;
    let target = resolve_under(&config.root, &[current, dir.as_str()])?;
    fs::create_dir_all(&target)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    let location = join_url_path(location, &format!("{}/", encode_path(&dir)));
    info!(upload_type = "directory", path = location, "directory created");
    Ok(Redirect::to(&location).into_response())
}

/// 以独占方式创建目标文件并流式写入分片内容，已存在则失败。
async fn write_part(
    config: &RequestConfig,
    current: &str,
    file_name: &str,
    field: &mut Field<'_>,
) -> Result<(), ApiError> {
    let checked = check_traversal(file_name)?;
    let target = resolve_under(&config.root, &[current, checked.as_str()])?;

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&target)
        .await
        .map_err(|err| ApiError::Internal(format!("{file_name}: {err}")))?;

    let written = match copy_field(field, &mut file).await {
        Ok(written) => written,
        Err(err) => {
            // 目标文件由本次请求创建，失败时删掉以免残留挡住重传。
            drop(file);
            if let Err(remove_err) = fs::remove_file(&target).await {
                warn!(path = %target.display(), error = %remove_err, "failed to remove partial upload");
            }
            return Err(match err {
                PartError::Body(text) => ApiError::BadRequest(format!("{file_name}: {text}")),
                PartError::Io(err) => ApiError::Internal(format!("{file_name}: {err}")),
            });
        }
    };

    debug!(path = %target.display(), bytes = written, "upload part saved");
    Ok(())
}

enum PartError {
    Body(String),
    Io(std::io::Error),
}

async fn copy_field(field: &mut Field<'_>, file: &mut File) -> Result<u64, PartError> {
    let mut written: u64 = 0;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|err| PartError::Body(err.body_text()))?
    {
        written += chunk.len() as u64;
        file.write_all(&chunk).await.map_err(PartError::Io)?;
    }
    file.flush().await.map_err(PartError::Io)?;
    Ok(written)
}

/// 收集查询串与 urlencoded 请求体中的 `files` 值。
async fn form_files(req: Request<AxumBody>) -> Result<Vec<String>, ApiError> {
    let Query(mut pairs) = Query::<Vec<(String, String)>>::try_from_uri(req.uri())
        .map_err(|err| ApiError::BadRequest(err.body_text()))?;

    if is_form_body(req.headers()) {
        let Form(body_pairs) = Form::<Vec<(String, String)>>::from_request(req, &())
            .await
            .map_err(|err| ApiError::BadRequest(err.body_text()))?;
        pairs.extend(body_pairs);
    }

    Ok(pairs
        .into_iter()
        .filter(|(key, _)| key == "files")
        .map(|(_, value)| value)
        .collect())
}

/// 递归删除 `current` 下的各个条目，遇到首个 I/O 错误即停止。
pub async fn delete(config: &RequestConfig, current: &str, names: &[String]) -> Result<(), ApiError> {
    if names.is_empty() {
        return Err(ApiError::BadRequest("missing files".into()));
    }

    let scope = resolve_under(&config.root, &[current])?;
    let mut targets = Vec::with_capacity(names.len());
    for name in names {
        let checked = check_traversal(name)?;
        let target = resolve_under(&config.root, &[current, checked.as_str()])?;
        if target == scope {
            return Err(ApiError::BadRequest(format!("invalid file name {name:?}")));
        }
        targets.push(target);
    }

    for target in &targets {
        remove_entry(target)
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
    }

    info!(upload_type = "delete", current, names = ?names, "entries deleted");
    Ok(())
}

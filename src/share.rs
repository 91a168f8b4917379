//! 分享链接的分配与解析。
//!
//! 每个分享是分享目录下的一个符号链接，名字由创建时的秒级时间戳编码而来。
//! 符号链接的独占创建是唯一的同步手段：同一秒内的并发分配只有一个成功，
//! 其余的在下一个一秒周期重试。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Form, FromRequest, Query};
use axum::http::Request;
use axum::response::{IntoResponse, Redirect, Response};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use std::fmt;
use std::io::ErrorKind;
use std::path::{MAIN_SEPARATOR, Path};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{RequestConfig, SHARE_RETRY_INTERVAL_SECS, SiteConfig};
use crate::error::ApiError;
use crate::guard::{check_traversal, clean_path, join_url_path};
use crate::http::{
    RouteMethod, decode_path, encode_path, forward, is_form_body, namespace_path,
};
use crate::storage::{ShareStore, resolve_under};

/// 分享 ID 的时间来源。
pub trait Clock: Send + Sync {
    fn unix_seconds(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_seconds(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_secs())
            .unwrap_or_default()
    }
}

pub type SharedClock = Arc<dyn Clock>;

/// 分享请求参数，来自查询串或 urlencoded 请求体。
#[derive(Deserialize)]
pub(crate) struct ShareParams {
    path: Option<String>,
}

/// 分配被取消的原因。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCause {
    Shutdown,
    Deadline,
}

impl fmt::Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelCause::Shutdown => f.write_str("server shutting down"),
            CancelCause::Deadline => f.write_str("deadline exceeded"),
        }
    }
}

enum Allocation {
    Attempt(u64),
    WaitForNextTick,
    Success(String),
    Cancelled(CancelCause),
}

/// 将秒级时间戳编码为分享 ID（4 字节大端，URL 安全无填充 base64）。
pub fn encode_share_id(unix_seconds: u64) -> String {
    URL_SAFE_NO_PAD.encode((unix_seconds as u32).to_be_bytes())
}

/// 拆分 `/<id>[/<tail>]`。
pub fn split_share_path(path: &str) -> (&str, &str) {
    let path = path.strip_prefix('/').unwrap_or(path);
    match path.split_once('/') {
        Some((id, tail)) => (id, tail),
        None => (path, ""),
    }
}

/// 分享命名空间入口：GET 解析，POST 分配。
pub async fn share_entry(
    Extension(site): Extension<Arc<SiteConfig>>,
    Extension(clock): Extension<SharedClock>,
    req: Request<AxumBody>,
) -> Result<Response, ApiError> {
    let relative = check_traversal(namespace_path(req.uri().path(), &site.share_prefix))?;
    decode_path(&relative)?;

    match RouteMethod::from(req.method()) {
        RouteMethod::Get | RouteMethod::Head => {
            let config = site.for_request(req.headers())?;
            let path = resolve_share(&config, &relative).await?;
            forward(req, &path, &config.root).await
        }
        RouteMethod::Post => {
            let config = site.for_request(req.headers())?;
            let request_path = req.uri().path().to_string();
            let params = share_params(req).await?;
            let deadline = site.share_timeout.map(|timeout| Instant::now() + timeout);
            let id = create_share(
                &config,
                params.path.as_deref().unwrap_or_default(),
                clock.as_ref(),
                &site.shutdown,
                deadline,
            )
            .await?;
            Ok(Redirect::to(&join_url_path(&request_path, &id)).into_response())
        }
        RouteMethod::Delete | RouteMethod::Other => Err(ApiError::MethodNotAllowed),
    }
}

/// 读取分享参数，请求体中的 `path` 优先于查询串。
async fn share_params(req: Request<AxumBody>) -> Result<ShareParams, ApiError> {
    let Query(query) = Query::<ShareParams>::try_from_uri(req.uri())
        .map_err(|err| ApiError::BadRequest(err.body_text()))?;
    if !is_form_body(req.headers()) {
        return Ok(query);
    }

    let Form(form) = Form::<ShareParams>::from_request(req, &())
        .await
        .map_err(|err| ApiError::BadRequest(err.body_text()))?;
    Ok(ShareParams {
        path: form.path.or(query.path),
    })
}

/// 为 `root` 下已存在的 `path` 创建分享，返回新 ID。
pub async fn create_share(
    config: &RequestConfig,
    path: &str,
    clock: &dyn Clock,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
) -> Result<String, ApiError> {
    if path.is_empty() {
        return Err(ApiError::BadRequest("missing ?path=".into()));
    }
    let path = check_traversal(path)?;
    let source = resolve_under(&config.root, &[path.as_str()])?;

    if fs::metadata(&source).await.is_err() {
        return Err(ApiError::NotFound);
    }

    let store = ShareStore::new(config.share_dir.clone());
    let id = allocate_link(&store, &source, clock, cancel, deadline).await?;
    info!(id, source = %source.display(), "share created");
    Ok(id)
}

/// 以独占方式创建符号链接，冲突时每秒重试直到成功或被取消。
pub async fn allocate_link(
    store: &ShareStore,
    source: &Path,
    clock: &dyn Clock,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
) -> Result<String, ApiError> {
    let retry = Duration::from_secs(SHARE_RETRY_INTERVAL_SECS);
    let mut ticker: Option<time::Interval> = None;
    let mut state = Allocation::Attempt(clock.unix_seconds());

    loop {
        state = match state {
            Allocation::Attempt(seconds) => {
                let id = encode_share_id(seconds);
                let created = store.create_link(&id, source).await;
                match created {
                    Ok(()) => Allocation::Success(id),
                    Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                        debug!(id, "share id taken, waiting for next tick");
                        Allocation::WaitForNextTick
                    }
                    Err(err) => return Err(ApiError::Internal(err.to_string())),
                }
            }
            Allocation::WaitForNextTick => {
                let ticker = ticker.get_or_insert_with(|| {
                    let mut interval = time::interval_at(Instant::now() + retry, retry);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    interval
                });
                let expired = async {
                    match deadline {
                        Some(deadline) => time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    _ = cancel.cancelled() => Allocation::Cancelled(CancelCause::Shutdown),
                    _ = expired => Allocation::Cancelled(CancelCause::Deadline),
                    _ = ticker.tick() => Allocation::Attempt(clock.unix_seconds()),
                }
            }
            Allocation::Success(id) => return Ok(id),
            Allocation::Cancelled(cause) => {
                return Err(ApiError::Internal(format!(
                    "share allocation cancelled: {cause}"
                )));
            }
        };
    }
}

/// 将 `/<id>[/<tail>]` 解析为 root 下的请求路径（已编码）。
pub async fn resolve_share(config: &RequestConfig, relative: &str) -> Result<String, ApiError> {
    let (id, tail) = split_share_path(relative);
    if id.is_empty() {
        return Err(ApiError::NotFound);
    }

    let store = ShareStore::new(config.share_dir.clone());
    // 非符号链接与不存在的 ID 一视同仁。
    let target = store.read_link(id).await.map_err(|err| {
        debug!(id, error = %err, "share lookup failed");
        ApiError::NotFound
    })?;

    let relative_target = match target.strip_prefix(&config.root) {
        Ok(rest) => rest.to_string_lossy().replace(MAIN_SEPARATOR, "/"),
        Err(_) => target.to_string_lossy().replace(MAIN_SEPARATOR, "/"),
    };
    let base = encode_path(&clean_path(&relative_target));

    if tail.is_empty() {
        Ok(base)
    } else {
        Ok(join_url_path(&base, tail))
    }
}

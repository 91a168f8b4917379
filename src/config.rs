//! CLI arguments, server defaults and the per-request configuration.

use axum::http::{HeaderMap, header};
use clap::Parser;
use shadow_rs::formatcp;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::build;
use crate::error::ApiError;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const HOST_PLACEHOLDER: &str = "{host}";
pub const DEFAULT_SHARE_PREFIX: &str = "/share";
pub const DEFAULT_SHARE_TIMEOUT_SECS: u64 = 30;
pub const SHARE_RETRY_INTERVAL_SECS: u64 = 1;
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "upshare", version = VERSION_INFO, about = "Upload and share file server")]
pub struct Args {
    #[arg(
        short = 'r',
        long,
        env = "UPSHARE_ROOT",
        default_value = ".upshare/www",
        help = "Served root directory ({host} is replaced per request)"
    )]
    pub root: String,
    #[arg(
        short = 's',
        long,
        env = "UPSHARE_SHARE_DIR",
        default_value = ".upshare/shares",
        help = "Directory holding share links"
    )]
    pub share_dir: String,
    #[arg(
        long,
        env = "UPSHARE_SHARE_PREFIX",
        default_value = DEFAULT_SHARE_PREFIX,
        help = "URL prefix of the share namespace"
    )]
    pub share_prefix: String,
    #[arg(
        long,
        env = "UPSHARE_UPLOAD_PREFIX",
        default_value = "",
        help = "URL prefix of the served tree accepting uploads and deletes"
    )]
    pub upload_prefix: String,
    #[arg(
        long,
        env = "UPSHARE_SHARE_TIMEOUT_SECS",
        default_value_t = DEFAULT_SHARE_TIMEOUT_SECS,
        help = "Deadline for share link allocation in seconds (0 to disable)"
    )]
    pub share_timeout_secs: u64,
    #[arg(
        long,
        env = "UPSHARE_UPLOAD_MAX_SIZE",
        default_value_t = 0,
        help = "Max upload body size in bytes (0 to disable)"
    )]
    pub upload_max_size: u64,
    #[arg(
        short = 'b',
        long = "bind",
        env = "UPSHARE_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "UPSHARE_HTTP_PORT",
        default_value_t = 5005,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "UPSHARE_HTTPS_PORT",
        default_value_t = 5006,
        help = "HTTPS port (only used with --tls-cert and --tls-key)"
    )]
    pub https_port: u16,
    #[arg(short = 'c', long, env = "UPSHARE_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "UPSHARE_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
}

/// Server-wide settings, built once in `main` and shared by every route.
#[derive(Debug, Clone)]
pub struct SiteConfig {
    /// Root directory template; may contain [`HOST_PLACEHOLDER`].
    pub root: String,
    pub share_dir: PathBuf,
    pub share_prefix: String,
    pub upload_prefix: String,
    pub share_timeout: Option<Duration>,
    pub shutdown: CancellationToken,
}

/// Directories an operation works against, resolved for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestConfig {
    pub root: PathBuf,
    pub share_dir: PathBuf,
}

impl SiteConfig {
    pub fn from_args(args: &Args, share_dir: PathBuf, shutdown: CancellationToken) -> Self {
        let share_timeout = match args.share_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Self {
            root: args.root.clone(),
            share_dir,
            share_prefix: normalize_prefix(&args.share_prefix),
            upload_prefix: normalize_prefix(&args.upload_prefix),
            share_timeout,
            shutdown,
        }
    }

    /// Expands the root template for a request; the result must be absolute.
    pub fn for_request(&self, headers: &HeaderMap) -> Result<RequestConfig, ApiError> {
        let root = if self.root.contains(HOST_PLACEHOLDER) {
            let host = request_host(headers)?;
            self.root.replace(HOST_PLACEHOLDER, host)
        } else {
            self.root.clone()
        };

        if root.is_empty() || !Path::new(&root).is_absolute() {
            return Err(ApiError::NoRootConfigured);
        }

        Ok(RequestConfig {
            root: PathBuf::from(root),
            share_dir: self.share_dir.clone(),
        })
    }

    pub fn is_templated(&self) -> bool {
        self.root.contains(HOST_PLACEHOLDER)
    }
}

/// Host header without the port, usable as a single path segment.
fn request_host(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(ApiError::NoRootConfigured)?;

    let host = if value.starts_with('[') {
        value.find(']').map(|end| &value[..=end]).unwrap_or(value)
    } else {
        value.split(':').next().unwrap_or(value)
    };

    if host.contains(['/', '\\']) || host.contains("..") {
        return Err(ApiError::Traversal);
    }
    if host.is_empty() {
        return Err(ApiError::NoRootConfigured);
    }
    Ok(host)
}

/// "" and "/" both mean the whole tree; otherwise a leading slash and no trailing one.
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn site(root: &str) -> SiteConfig {
        SiteConfig {
            root: root.to_string(),
            share_dir: PathBuf::from("/srv/shares"),
            share_prefix: DEFAULT_SHARE_PREFIX.to_string(),
            upload_prefix: String::new(),
            share_timeout: None,
            shutdown: CancellationToken::new(),
        }
    }

    fn host_headers(host: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static(host));
        headers
    }

    #[test]
    fn plain_root_is_used_as_is() {
        let config = site("/srv/www")
            .for_request(&HeaderMap::new())
            .unwrap_or_else(|_| panic!("root should resolve"));
        assert_eq!(config.root, PathBuf::from("/srv/www"));
        assert_eq!(config.share_dir, PathBuf::from("/srv/shares"));
    }

    #[test]
    fn relative_root_fails_closed() {
        let result = site("srv/www").for_request(&HeaderMap::new());
        assert!(matches!(result, Err(ApiError::NoRootConfigured)));

        let result = site("").for_request(&HeaderMap::new());
        assert!(matches!(result, Err(ApiError::NoRootConfigured)));
    }

    #[test]
    fn host_placeholder_is_expanded_without_port() {
        let config = site("/srv/{host}/www")
            .for_request(&host_headers("example.org:8080"))
            .unwrap_or_else(|_| panic!("root should resolve"));
        assert_eq!(config.root, PathBuf::from("/srv/example.org/www"));

        let config = site("/srv/{host}")
            .for_request(&host_headers("[::1]:5005"))
            .unwrap_or_else(|_| panic!("root should resolve"));
        assert_eq!(config.root, PathBuf::from("/srv/[::1]"));
    }

    #[test]
    fn templated_root_without_host_fails_closed() {
        let result = site("/srv/{host}").for_request(&HeaderMap::new());
        assert!(matches!(result, Err(ApiError::NoRootConfigured)));
    }

    #[test]
    fn host_cannot_escape_root() {
        let result = site("/srv/{host}").for_request(&host_headers(".."));
        assert!(matches!(result, Err(ApiError::Traversal)));
    }

    #[test]
    fn prefixes_are_normalized() {
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("/"), "");
        assert_eq!(normalize_prefix("share/"), "/share");
        assert_eq!(normalize_prefix("/files"), "/files");
    }

    #[test]
    fn bind_flag_sets_listen_address() {
        let args = Args::try_parse_from(["upshare", "--bind", "127.0.0.1"])
            .unwrap_or_else(|err| panic!("args should parse: {err}"));
        assert_eq!(args.host, "127.0.0.1");

        let args = Args::try_parse_from(["upshare", "-b", "::1"])
            .unwrap_or_else(|err| panic!("args should parse: {err}"));
        assert_eq!(args.host, "::1");
    }
}

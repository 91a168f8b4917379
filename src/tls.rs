//! 可选 HTTPS：证书与私钥同时配置时加载 Rustls 配置。

use axum_server::tls_rustls::RustlsConfig;
use std::io::{Error, ErrorKind};
use tracing::info;

use crate::config::Args;

/// 未配置证书时返回 `None`，只配置了一半视为错误。
pub async fn load_rustls_config(args: &Args) -> Result<Option<RustlsConfig>, Error> {
    match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => {
            let config = RustlsConfig::from_pem_file(cert, key).await?;
            info!(cert, "loaded tls certificate");
            Ok(Some(config))
        }
        (None, None) => Ok(None),
        _ => Err(Error::new(
            ErrorKind::InvalidInput,
            "--tls-cert and --tls-key must be set together",
        )),
    }
}

//! 路径穿越检查与 URL 路径拼接工具。

use crate::error::ApiError;

/// 规范化为以 `/` 开头的路径，包含 `/..` 时拒绝。
pub fn check_traversal(path: &str) -> Result<String, ApiError> {
    let normalized = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };

    if normalized.contains("/..") {
        return Err(ApiError::Traversal);
    }

    Ok(normalized)
}

/// 对斜杠路径做词法清理，结果总以 `/` 开头。
pub fn clean_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

/// 拼接并清理 URL 路径，`tail` 以 `/` 结尾时保留末尾斜杠。
pub fn join_url_path(base: &str, tail: &str) -> String {
    let joined = clean_path(&format!("{base}/{tail}"));
    if tail.ends_with('/') && joined != "/" {
        format!("{joined}/")
    } else {
        joined
    }
}

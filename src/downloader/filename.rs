//! 文件名处理
//!
//! - 从 URL、Content-Disposition 推导文件名
//! - 预留不冲突的文件路径（`sample.txt` → `sample.1.txt` → ...）

use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tracing::debug;
use url::Url;

use crate::error::{DownloadError, Result};

/// 文件名为空时使用的占位名
pub const DEFAULT_FILE_NAME: &str = "unnamed";

/// 预留文件名的最大尝试次数
const MAX_NAME_ATTEMPTS: u32 = 10_000;

/// 查找并预留一个未使用的文件名
///
/// 以独占创建（create_new）的方式创建空文件，因此并发调用不会得到同一个路径。
/// 只有"文件已存在"会继续尝试下一个名字，其他 IO 错误直接返回
pub async fn unused_name(dir: &Path, file_name: &str) -> Result<PathBuf> {
    let file_name = sanitize_file_name(file_name);
    let (stem, ext) = split_extension(&file_name);

    let mut candidate = dir.join(&file_name);
    for counter in 1..=MAX_NAME_ATTEMPTS {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(_) => {
                debug!("预留文件名: {:?}", candidate);
                return Ok(candidate);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                candidate = dir.join(format!("{}.{}{}", stem, counter, ext));
            }
            Err(e) => return Err(DownloadError::io(candidate, e)),
        }
    }

    Err(DownloadError::io(
        dir.join(&file_name),
        std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "no unused file name available",
        ),
    ))
}

/// 拆分扩展名（包含点）
fn split_extension(file_name: &str) -> (&str, &str) {
    match file_name.rfind('.') {
        Some(pos) if pos > 0 => (&file_name[..pos], &file_name[pos..]),
        _ => (file_name, ""),
    }
}

/// 替换文件系统不允许的字符，去掉路径部分
pub fn sanitize_file_name(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name)
        .trim();

    let sanitized: String = base
        .chars()
        .map(|c| match c {
            ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() || sanitized == "." || sanitized == ".." {
        DEFAULT_FILE_NAME.to_string()
    } else {
        sanitized
    }
}

/// URL 路径最后一段（已解码）
pub fn file_name_from_url(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.next_back()?;
    if segment.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string());
    Some(decoded)
}

/// 解析 Content-Disposition 中的文件名
///
/// 支持：
/// - `attachment; filename="example.zip"`
/// - `attachment; filename=example.zip;`（容忍末尾多余的分号）
/// - `attachment; filename*=UTF-8''example.zip`（RFC 5987，优先）
pub fn parse_content_disposition(header: &str) -> Option<String> {
    let header = header.trim().trim_end_matches(';');

    // 优先 filename*=
    if let Some(pos) = header.find("filename*=") {
        let value = header[pos + 10..].trim();
        if let Some(quote_pos) = value.find("''") {
            let encoded = &value[quote_pos + 2..];
            let end = encoded.find(';').unwrap_or(encoded.len());
            let encoded_name = encoded[..end].trim().trim_matches('"');
            if let Ok(decoded) = urlencoding::decode(encoded_name) {
                if !decoded.is_empty() {
                    return Some(decoded.into_owned());
                }
            }
        }
    }

    // 普通 filename=
    let mut search = header;
    while let Some(pos) = search.find("filename=") {
        // 跳过 filename*= 的误匹配
        if pos > 0 && search.as_bytes()[pos - 1] == b'*' {
            search = &search[pos + 9..];
            continue;
        }

        let value = search[pos + 9..].trim();
        if let Some(stripped) = value.strip_prefix('"') {
            if let Some(end) = stripped.find('"') {
                let name = &stripped[..end];
                if !name.is_empty() {
                    return Some(name.to_string());
                }
            }
        } else {
            let end = value.find(';').unwrap_or(value.len());
            let name = value[..end].trim();
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
        break;
    }

    None
}

/// Content-Type 是否为 HTML 页面
pub fn is_html_content_type(content_type: &str) -> bool {
    content_type
        .trim_start()
        .to_ascii_lowercase()
        .starts_with("text/html")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_unused_name_sequence() {
        let dir = tempdir().unwrap();

        let first = unused_name(dir.path(), "sample.txt").await.unwrap();
        let second = unused_name(dir.path(), "sample.txt").await.unwrap();
        let third = unused_name(dir.path(), "sample.txt").await.unwrap();

        assert_eq!(first, dir.path().join("sample.txt"));
        assert_eq!(second, dir.path().join("sample.1.txt"));
        assert_eq!(third, dir.path().join("sample.2.txt"));
        assert!(third.exists());
    }

    #[tokio::test]
    async fn test_unused_name_empty() {
        let dir = tempdir().unwrap();
        let path = unused_name(dir.path(), "").await.unwrap();
        assert_eq!(path, dir.path().join("unnamed"));
    }

    #[tokio::test]
    async fn test_unused_name_missing_dir_is_error() {
        let dir = tempdir().unwrap();
        let err = unused_name(&dir.path().join("missing"), "a.zip")
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Io { .. }));
    }

    #[test]
    fn test_parse_content_disposition() {
        assert_eq!(
            parse_content_disposition(r#"attachment; filename="mod v1.2.zip""#),
            Some("mod v1.2.zip".to_string())
        );
        assert_eq!(
            parse_content_disposition("attachment; filename=archive.7z;"),
            Some("archive.7z".to_string())
        );
        assert_eq!(
            parse_content_disposition(
                "attachment; filename=\"fallback.zip\"; filename*=UTF-8''%E6%A8%A1%E7%BB%84.zip"
            ),
            Some("模组.zip".to_string())
        );
        assert_eq!(parse_content_disposition("inline"), None);
    }

    #[test]
    fn test_file_name_from_url() {
        let url = Url::parse("https://cdn.example.com/files/My%20Mod.zip?key=1").unwrap();
        assert_eq!(file_name_from_url(&url), Some("My Mod.zip".to_string()));

        let url = Url::parse("https://cdn.example.com/").unwrap();
        assert_eq!(file_name_from_url(&url), None);
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("a:b?.zip"), "a_b_.zip");
        assert_eq!(sanitize_file_name("  "), "unnamed");
    }

    #[test]
    fn test_html_content_type() {
        assert!(is_html_content_type("text/html; charset=utf-8"));
        assert!(is_html_content_type("TEXT/HTML"));
        assert!(!is_html_content_type("application/octet-stream"));
    }
}

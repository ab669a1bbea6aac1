use std::path::{Component, Path, PathBuf};

use crate::plugins::ExtensionError;

pub mod markdown;

/// 从文本生成 URL 友好的别名
pub fn slugify(text: &str) -> String {
    slug::slugify(text)
}

/// 确保路径以斜杠开头
pub fn ensure_leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// 解析点分整数版本号，例如 `1.2.10` -> [1, 2, 10]
pub fn parse_version(version: &str) -> Result<Vec<u64>, ExtensionError> {
    let trimmed = version.trim();
    if trimmed.is_empty() {
        return Err(ExtensionError::InvalidVersion { version: version.to_string() });
    }
    trimmed
        .split('.')
        .map(|part| {
            part.parse::<u64>()
                .map_err(|_| ExtensionError::InvalidVersion { version: version.to_string() })
        })
        .collect()
}

/// 转换为相对项目根目录的路径，根目录之外的路径保持绝对
pub fn to_project_relative(base_dir: &Path, path: &Path) -> PathBuf {
    match path.strip_prefix(base_dir) {
        Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
        _ => path.to_path_buf(),
    }
}

/// 读取时把存储的路径还原为绝对路径
pub fn to_absolute(base_dir: &Path, stored: &str) -> PathBuf {
    let path = Path::new(stored);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// 单段路径名是否安全（不含分隔符、不是 `.`/`..`）
pub fn is_safe_segment(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.contains('/')
        && !name.contains('\\')
}

/// 把 `/posts/<int:id>` 风格的路由改写为 axum 的 `/posts/:id`
pub fn normalize_route_pattern(route: &str) -> String {
    let route = ensure_leading_slash(route.trim());
    route
        .split('/')
        .map(|segment| {
            match segment.strip_prefix('<').and_then(|s| s.strip_suffix('>')) {
                Some(inner) => {
                    let name = inner.rsplit(':').next().unwrap_or(inner);
                    format!(":{}", name)
                }
                None => segment.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("1.2.10").unwrap(), vec![1, 2, 10]);
        assert_eq!(parse_version(" 2 ").unwrap(), vec![2]);
        assert!(parse_version("1..2").is_err());
        assert!(parse_version("1.0-beta").is_err());
        assert!(parse_version("").is_err());
    }

    #[test]
    fn test_version_tuple_ordering() {
        assert!(parse_version("1.0").unwrap() < parse_version("1.0.0").unwrap());
        assert!(parse_version("1.9").unwrap() < parse_version("1.10").unwrap());
    }

    #[test]
    fn test_project_relative_paths() {
        let base = PathBuf::from("/srv/blog");
        let rel = to_project_relative(&base, Path::new("/srv/blog/plugins/seo"));
        assert_eq!(rel, PathBuf::from("plugins/seo"));
        assert_eq!(to_absolute(&base, "plugins/seo"), PathBuf::from("/srv/blog/plugins/seo"));

        let outside = to_project_relative(&base, Path::new("/opt/ext/seo"));
        assert_eq!(outside, PathBuf::from("/opt/ext/seo"));
        assert_eq!(to_absolute(&base, "/opt/ext/seo"), PathBuf::from("/opt/ext/seo"));
    }

    #[test]
    fn test_safe_segment() {
        assert!(is_safe_segment("aurora"));
        assert!(!is_safe_segment(".."));
        assert!(!is_safe_segment("a/b"));
        assert!(!is_safe_segment(""));
    }

    #[test]
    fn test_normalize_route_pattern() {
        assert_eq!(normalize_route_pattern("/aurora/timeline"), "/aurora/timeline");
        assert_eq!(normalize_route_pattern("p/<slug>"), "/p/:slug");
        assert_eq!(normalize_route_pattern("/p/<int:id>/edit"), "/p/:id/edit");
        assert_eq!(normalize_route_pattern("/p/:id"), "/p/:id");
    }
}

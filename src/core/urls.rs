use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde_json::{Map, Value};
use tracing::{debug, warn};
use url::Url;

/// 端点名到路由模式的映射，供模板中的 `url_for` 使用
pub struct UrlResolver {
    endpoints: RwLock<HashMap<String, String>>,
}

impl Default for UrlResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl UrlResolver {
    pub fn new() -> Self {
        let builtin = [
            ("main.index", "/"),
            ("theme_static", "/themes/:theme/static/*filename"),
            ("plugin_static", "/static/plugins/:plugin/*filename"),
            ("admin.index", "/admin"),
            ("admin.plugins", "/admin/plugins"),
            ("admin.themes", "/admin/themes"),
        ];
        Self {
            endpoints: RwLock::new(
                builtin.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            ),
        }
    }

    /// 注册端点，已存在时保留原有映射并返回 false
    pub fn register(&self, endpoint: &str, pattern: &str) -> bool {
        let mut endpoints = self.endpoints.write().unwrap_or_else(PoisonError::into_inner);
        if endpoints.contains_key(endpoint) {
            warn!("端点 {} 已存在，忽略 {}", endpoint, pattern);
            return false;
        }
        debug!("注册端点 {} -> {}", endpoint, pattern);
        endpoints.insert(endpoint.to_string(), pattern.to_string());
        true
    }

    pub fn contains(&self, endpoint: &str) -> bool {
        self.endpoints.read().unwrap_or_else(PoisonError::into_inner).contains_key(endpoint)
    }

    /// 生成 URL，多余的参数放入查询字符串
    pub fn url_for(&self, endpoint: &str, params: &Map<String, Value>) -> String {
        let pattern = self
            .endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
            .cloned()
            .unwrap_or_else(|| format!("/{}", endpoint.replace('.', "/")));

        let mut used = Vec::new();
        let path = pattern
            .split('/')
            .map(|segment| {
                if let Some(name) = segment.strip_prefix(':') {
                    if let Some(value) = params.get(name) {
                        used.push(name.to_string());
                        return encode_segment(&value_to_string(value));
                    }
                } else if let Some(name) = segment.strip_prefix('*') {
                    // 通配参数保留其中的 `/`
                    if let Some(value) = params.get(name) {
                        used.push(name.to_string());
                        return value_to_string(value).split('/').map(encode_segment).collect::<Vec<_>>().join("/");
                    }
                }
                segment.to_string()
            })
            .collect::<Vec<_>>()
            .join("/");

        let extra: Vec<(&String, &Value)> = params.iter().filter(|(k, _)| !used.contains(k)).collect();
        if extra.is_empty() {
            return path;
        }
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(extra.iter().map(|(k, v)| (k.as_str(), value_to_string(v))))
            .finish();
        format!("{}?{}", path, query)
    }
}

/// 按路径段规则百分号编码，`/` 也会被编码
fn encode_segment(raw: &str) -> String {
    let Ok(mut url) = Url::parse("http://localhost/") else {
        return raw.to_string();
    };
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.clear().push(raw);
    }
    url.path().trim_start_matches('/').to_string()
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::plugins::ExtensionError;
use crate::utils::parse_version;

/// 扩展类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionKind {
    Plugin,
    Theme,
}

impl ExtensionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtensionKind::Plugin => "plugin",
            ExtensionKind::Theme => "theme",
        }
    }

    /// 该类型扩展的清单文件名
    pub fn manifest_file(&self) -> &'static str {
        match self {
            ExtensionKind::Plugin => "plugin.json",
            ExtensionKind::Theme => "theme.json",
        }
    }
}

impl fmt::Display for ExtensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExtensionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plugin" => Ok(ExtensionKind::Plugin),
            "theme" => Ok(ExtensionKind::Theme),
            other => Err(format!("未知的扩展类型: {}", other)),
        }
    }
}

/// 扩展的唯一标识，同时作为加载命名空间
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExtensionId {
    pub kind: ExtensionKind,
    pub name: String,
}

impl ExtensionId {
    pub fn new(kind: ExtensionKind, name: impl Into<String>) -> Self {
        Self { kind, name: name.into() }
    }

    pub fn plugin(name: impl Into<String>) -> Self {
        Self::new(ExtensionKind::Plugin, name)
    }

    pub fn theme(name: impl Into<String>) -> Self {
        Self::new(ExtensionKind::Theme, name)
    }

    /// 命名空间形如 `plugin:hello_world`
    pub fn namespace(&self) -> String {
        format!("{}:{}", self.kind, self.name)
    }
}

impl fmt::Display for ExtensionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// 自定义页面声明
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomPage {
    /// 路由，支持 `/a/<slug>` 和 `/a/:slug` 两种写法
    pub route: String,
    /// 模板名
    pub template: String,
    /// 端点名，缺省时由路由生成
    #[serde(default, alias = "name")]
    pub endpoint: Option<String>,
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
    /// 静态上下文
    #[serde(default)]
    pub context: Map<String, Value>,
}

fn default_methods() -> Vec<String> {
    vec!["GET".to_string()]
}

impl CustomPage {
    pub fn new(route: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            template: template.into(),
            endpoint: None,
            methods: default_methods(),
            context: Map::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

/// 扩展清单（plugin.json / theme.json）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub author_website: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub min_noteblog_version: Option<String>,
    #[serde(default)]
    pub max_noteblog_version: Option<String>,
    #[serde(default)]
    pub is_system: bool,
    #[serde(default)]
    pub config_schema: Option<Value>,
    #[serde(default)]
    pub custom_pages: Vec<CustomPage>,
    /// 动态库文件，相对于扩展目录
    #[serde(default)]
    pub entry: Option<String>,
    #[serde(default)]
    pub screenshot: Option<String>,
    #[serde(default)]
    pub demo_url: Option<String>,
}

impl Manifest {
    /// 从扩展目录读取清单
    pub fn load(kind: ExtensionKind, dir: &Path) -> Result<Self, ExtensionError> {
        let path = dir.join(kind.manifest_file());
        let content = std::fs::read_to_string(&path).map_err(|e| ExtensionError::ManifestError {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|e| ExtensionError::ManifestError {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }
}

/// 注册表中的扩展记录（插件与主题共用）
#[derive(Debug, Clone, Serialize)]
pub struct ExtensionRecord {
    pub id: i64,
    pub kind: ExtensionKind,
    pub name: String,
    pub display_name: String,
    pub description: Option<String>,
    pub version: String,
    pub author: Option<String>,
    pub author_website: Option<String>,
    pub license: Option<String>,
    pub min_version: Option<String>,
    pub max_version: Option<String>,
    pub is_active: bool,
    pub is_system: bool,
    /// 绝对路径（存储时为相对项目根目录的路径）
    pub install_path: PathBuf,
    pub entry: Option<String>,
    pub screenshot: Option<String>,
    pub demo_url: Option<String>,
    pub config_schema: Value,
    pub config_data: Value,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
}

impl ExtensionRecord {
    pub fn extension_id(&self) -> ExtensionId {
        ExtensionId::new(self.kind, self.name.clone())
    }

    pub fn has_config(&self) -> bool {
        !self.config_schema.is_null()
            && self.config_schema.as_object().map_or(true, |o| !o.is_empty())
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.install_path.join("templates")
    }

    /// 检查与应用版本的兼容性，版本号格式错误时返回错误而不是猜测
    pub fn is_compatible(&self, app_version: &str) -> Result<bool, ExtensionError> {
        let min = self.min_version.as_deref().filter(|v| !v.trim().is_empty());
        let max = self.max_version.as_deref().filter(|v| !v.trim().is_empty());
        if min.is_none() && max.is_none() {
            return Ok(true);
        }

        let current = parse_version(app_version)?;
        if let Some(min) = min {
            if current < parse_version(min)? {
                return Ok(false);
            }
        }
        if let Some(max) = max {
            if current > parse_version(max)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// 钩子类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookKind {
    Action,
    Filter,
    Template,
}

impl HookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::Action => "action",
            HookKind::Filter => "filter",
            HookKind::Template => "template",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 钩子注册的元数据（不含回调本身）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookRecord {
    pub hook_name: String,
    pub hook_type: HookKind,
    pub priority: i32,
    pub accepted_args: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(min: Option<&str>, max: Option<&str>) -> ExtensionRecord {
        ExtensionRecord {
            id: 1,
            kind: ExtensionKind::Plugin,
            name: "demo".to_string(),
            display_name: "Demo".to_string(),
            description: None,
            version: "1.0.0".to_string(),
            author: None,
            author_website: None,
            license: None,
            min_version: min.map(String::from),
            max_version: max.map(String::from),
            is_active: false,
            is_system: false,
            install_path: PathBuf::from("/tmp/demo"),
            entry: None,
            screenshot: None,
            demo_url: None,
            config_schema: Value::Null,
            config_data: json!({}),
            installed_at: Utc::now(),
            updated_at: Utc::now(),
            activated_at: None,
        }
    }

    #[test]
    fn test_absent_bounds_always_compatible() {
        assert!(record(None, None).is_compatible("0.1").unwrap());
        assert!(record(Some(""), Some(" ")).is_compatible("99.0").unwrap());
    }

    #[test]
    fn test_bounds_compare_as_integer_tuples() {
        let r = record(Some("1.2"), Some("1.10"));
        assert!(r.is_compatible("1.9").unwrap());
        assert!(r.is_compatible("1.10").unwrap());
        assert!(!r.is_compatible("1.11").unwrap());
        assert!(!r.is_compatible("1.1.9").unwrap());
    }

    #[test]
    fn test_malformed_bound_fails_loudly() {
        let r = record(Some("1.x"), None);
        assert!(matches!(
            r.is_compatible("1.0"),
            Err(ExtensionError::InvalidVersion { .. })
        ));
        let r = record(Some("1.0"), None);
        assert!(r.is_compatible("v2").is_err());
    }

    #[test]
    fn test_manifest_defaults() {
        let manifest: Manifest = serde_json::from_str(r#"{"display_name": "Aurora",
            "custom_pages": [{"route": "/a/<slug>", "template": "a.html"}]}"#).unwrap();
        assert_eq!(manifest.display_name.as_deref(), Some("Aurora"));
        assert!(!manifest.is_system);
        assert_eq!(manifest.custom_pages[0].methods, vec!["GET".to_string()]);
        assert!(manifest.custom_pages[0].endpoint.is_none());
    }

    #[test]
    fn test_extension_id_namespace() {
        assert_eq!(ExtensionId::plugin("seo").namespace(), "plugin:seo");
        assert_eq!(ExtensionId::theme("seo").to_string(), "theme:seo");
        assert_ne!(ExtensionId::plugin("seo"), ExtensionId::theme("seo"));
    }
}

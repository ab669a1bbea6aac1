use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use chrono::{DateTime, NaiveDateTime};
use serde_json::{json, Map, Value};
use tera::Tera;
use tracing::{debug, error, warn};
use walkdir::WalkDir;

use super::context::SiteData;
use crate::core::urls::UrlResolver;
use crate::models::{Config, ExtensionRecord};
use crate::plugins::hooks::{SIDEBAR_BOTTOM, TEMPLATE_CONTEXT};
use crate::plugins::ExtensionRuntime;

/// 按主题缓存的模板引擎
struct ThemeEngine {
    theme: String,
    generation: u64,
    tera: Tera,
}

impl ThemeEngine {
    fn has_template(&self, name: &str) -> bool {
        self.tera.get_template_names().any(|n| n == name)
    }
}

/// 主题渲染器
///
/// 模板先在激活主题中查找，找不到时回退到默认主题；两者都没有时返回内联错误片段。
pub struct ThemeRenderer {
    runtime: Arc<ExtensionRuntime>,
    urls: Arc<UrlResolver>,
    site: SiteData,
    config: Config,
    cache: RwLock<Option<Arc<ThemeEngine>>>,
}

impl ThemeRenderer {
    pub fn new(runtime: Arc<ExtensionRuntime>, urls: Arc<UrlResolver>, config: Config) -> Self {
        let site = SiteData::new(runtime.registry().pool().clone(), config.recent_posts_limit);
        Self {
            runtime,
            urls,
            site,
            config,
            cache: RwLock::new(None),
        }
    }

    pub fn urls(&self) -> &Arc<UrlResolver> {
        &self.urls
    }

    /// 渲染模板，任何错误都以 HTML 片段返回
    pub async fn render(&self, template: &str, context: Map<String, Value>) -> String {
        let theme = self.runtime.active_theme();
        let theme_name = theme
            .as_ref()
            .map(|t| t.name.clone())
            .unwrap_or_else(|| self.config.default_theme.clone());
        let theme_config = theme.as_ref().map(|t| t.config_data.clone()).unwrap_or_else(|| json!({}));

        let mut context = context;
        self.fill_baseline(&mut context, &theme_name, &theme_config).await;

        // 返回非对象的过滤器只跳过它自己这一步
        let filtered = self.runtime.hooks().apply_filters_checked(
            TEMPLATE_CONTEXT,
            Value::Object(context),
            &[],
            Value::is_object,
        );

        let engine = self.engine(&theme_name, theme.as_ref(), &theme_config);

        if !engine.has_template(template) {
            warn!("模板 {} 在主题 {} 和默认主题中都不存在", template, theme_name);
            return not_found_fragment(template);
        }

        let tera_context = match tera::Context::from_value(filtered) {
            Ok(ctx) => ctx,
            Err(e) => {
                error!("模板 {} 的上下文无效: {}", template, error_chain(&e));
                return error_fragment(template);
            }
        };

        match engine.tera.render(template, &tera_context) {
            Ok(html) => html,
            Err(e) => {
                error!("模板 {} 渲染失败: {}", template, error_chain(&e));
                error_fragment(template)
            }
        }
    }

    /// 渲染并附带状态码，用于错误页
    pub async fn render_status(&self, template: &str, context: Map<String, Value>, status: StatusCode) -> Response {
        (status, Html(self.render(template, context).await)).into_response()
    }

    /// 丢弃模板缓存，下次渲染时重新加载
    pub fn reload_templates(&self) {
        debug!("重新加载主题模板");
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// 基础上下文，已有的键不覆盖，每一项单独降级
    async fn fill_baseline(&self, context: &mut Map<String, Value>, theme_name: &str, theme_config: &Value) {
        if !context.contains_key("recent_posts") {
            let posts = self.site.recent_posts().await.unwrap_or_else(|e| {
                warn!("获取最近文章失败: {}", e);
                json!([])
            });
            context.insert("recent_posts".to_string(), posts);
        }
        if !context.contains_key("categories") {
            let categories = self.site.categories().await.unwrap_or_else(|e| {
                warn!("获取分类失败: {}", e);
                json!([])
            });
            context.insert("categories".to_string(), categories);
        }
        if !context.contains_key("tags") {
            let tags = self.site.tags().await.unwrap_or_else(|e| {
                warn!("获取标签失败: {}", e);
                json!([])
            });
            context.insert("tags".to_string(), tags);
        }
        if !context.contains_key("site_title") {
            let title = self.setting_or("site_title", &self.config.site_title).await;
            context.insert("site_title".to_string(), json!(title));
        }
        if !context.contains_key("site_description") {
            let description = self.setting_or("site_description", &self.config.site_description).await;
            context.insert("site_description".to_string(), json!(description));
        }
        context.entry("current_user").or_insert(Value::Null);
        if !context.contains_key("plugin_hooks") {
            let sidebar = self.runtime.hooks().get_template_hooks(SIDEBAR_BOTTOM);
            context.insert("plugin_hooks".to_string(), json!({ "sidebar_bottom": sidebar }));
        }
        context.entry("active_theme").or_insert_with(|| json!(theme_name));
        context.entry("theme_config").or_insert_with(|| theme_config.clone());
    }

    async fn setting_or(&self, key: &str, fallback: &str) -> String {
        match self.site.setting(key).await {
            Ok(Some(value)) => value,
            Ok(None) => fallback.to_string(),
            Err(e) => {
                warn!("读取站点设置 {} 失败: {}", key, e);
                fallback.to_string()
            }
        }
    }

    fn engine(&self, theme_name: &str, theme: Option<&ExtensionRecord>, theme_config: &Value) -> Arc<ThemeEngine> {
        let generation = self.runtime.generation();
        if let Some(cached) = self.cache.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
            if cached.theme == theme_name && cached.generation == generation {
                return Arc::clone(cached);
            }
        }

        let default_dir = self.runtime.themes_dir().join(&self.config.default_theme).join("templates");
        let theme_dir = theme.map(|t| t.templates_dir());
        let tera = self.build_tera(theme_name, theme_dir.as_deref(), &default_dir, theme_config);

        let engine = Arc::new(ThemeEngine {
            theme: theme_name.to_string(),
            generation,
            tera,
        });
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&engine));
        engine
    }

    fn build_tera(&self, theme_name: &str, theme_dir: Option<&Path>, default_dir: &Path, theme_config: &Value) -> Tera {
        let mut layers = vec![collect_templates(default_dir)];
        if let Some(dir) = theme_dir.filter(|d| *d != default_dir) {
            layers.push(collect_templates(dir));
        }

        let mut tera = Tera::default();
        tera.register_filter("markdown", markdown_filter);
        tera.register_filter("date_format", date_format_filter);
        self.register_functions(&mut tera, theme_name, theme_config);

        let added = add_layers(&mut tera, layers);
        debug!("主题 {} 共加载 {} 个模板", theme_name, added);
        tera
    }

    fn register_functions(&self, tera: &mut Tera, theme_name: &str, theme_config: &Value) {
        // 调用时再取钩子总线，总是使用最近一次加载的结果
        let runtime = Arc::clone(&self.runtime);
        tera.register_function("get_template_hooks", move |args: &HashMap<String, Value>| {
            let name = required_str(args, "name")?;
            Ok(Value::Array(runtime.hooks().get_template_hooks(name)))
        });

        let runtime = Arc::clone(&self.runtime);
        tera.register_function("apply_filters", move |args: &HashMap<String, Value>| {
            let name = required_str(args, "name")?;
            let value = args.get("value").cloned().unwrap_or(Value::Null);
            let extra = match args.get("args") {
                Some(Value::Array(items)) => items.clone(),
                _ => Vec::new(),
            };
            Ok(runtime.hooks().apply_filters(name, value, &extra))
        });

        let config = theme_config.clone();
        tera.register_function("get_theme_config", move |_: &HashMap<String, Value>| Ok(config.clone()));

        let urls = Arc::clone(&self.urls);
        tera.register_function("url_for", move |args: &HashMap<String, Value>| {
            let endpoint = required_str(args, "endpoint")?;
            let params: Map<String, Value> = args
                .iter()
                .filter(|(k, _)| k.as_str() != "endpoint")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Ok(json!(urls.url_for(endpoint, &params)))
        });

        let urls = Arc::clone(&self.urls);
        let theme = theme_name.to_string();
        tera.register_function("theme_static", move |args: &HashMap<String, Value>| {
            let filename = required_str(args, "filename")?;
            let mut params = Map::new();
            params.insert("theme".to_string(), json!(theme));
            params.insert("filename".to_string(), json!(filename));
            Ok(json!(urls.url_for("theme_static", &params)))
        });
    }
}

/// 逐个添加模板，后面的层覆盖前面的同名模板
///
/// 解析失败的模板只跳过它自己，同名的下层模板继续生效。依赖尚未加载的父模板或宏文件的
/// 模板会在下一轮重试，直到某一轮没有任何进展。
fn add_layers(tera: &mut Tera, layers: Vec<BTreeMap<String, PathBuf>>) -> usize {
    let mut pending: Vec<(usize, String, String)> = Vec::new();
    for (layer, files) in layers.into_iter().enumerate() {
        for (name, path) in files {
            match std::fs::read_to_string(&path) {
                Ok(content) => pending.push((layer, name, content)),
                Err(e) => warn!("读取模板 {} 失败: {}", path.display(), e),
            }
        }
    }

    let mut owners: HashMap<String, usize> = HashMap::new();
    loop {
        let mut failed = Vec::new();
        let mut errors = Vec::new();
        let mut progressed = false;
        for (layer, name, content) in std::mem::take(&mut pending) {
            if owners.get(&name).is_some_and(|owner| *owner > layer) {
                continue;
            }
            let mut next = tera.clone();
            match next.add_raw_template(&name, &content) {
                Ok(()) => {
                    *tera = next;
                    owners.insert(name, layer);
                    progressed = true;
                }
                Err(e) => {
                    errors.push((name.clone(), error_chain(&e)));
                    failed.push((layer, name, content));
                }
            }
        }

        if failed.is_empty() {
            break;
        }
        if !progressed {
            for (name, message) in errors {
                error!("模板 {} 无法加载，已跳过: {}", name, message);
            }
            break;
        }
        pending = failed;
    }
    owners.len()
}

/// 收集目录下的模板文件，名称使用 `/` 分隔的相对路径
fn collect_templates(dir: &Path) -> BTreeMap<String, PathBuf> {
    let mut files = BTreeMap::new();
    if !dir.is_dir() {
        return files;
    }
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(dir) {
            let name = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.insert(name, entry.path().to_path_buf());
        }
    }
    files
}

fn required_str<'a>(args: &'a HashMap<String, Value>, key: &str) -> tera::Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| tera::Error::msg(format!("缺少必要的参数: {}", key)))
}

fn markdown_filter(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    match value.as_str() {
        Some(text) => Ok(Value::String(crate::utils::markdown::render(text))),
        None => Ok(value.clone()),
    }
}

fn date_format_filter(value: &Value, args: &HashMap<String, Value>) -> tera::Result<Value> {
    let format = args.get("format").and_then(Value::as_str).unwrap_or("%Y-%m-%d");
    let Some(text) = value.as_str() else {
        return Ok(value.clone());
    };
    if let Ok(date) = DateTime::parse_from_rfc3339(text) {
        return Ok(Value::String(date.format(format).to_string()));
    }
    if let Ok(date) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Ok(Value::String(date.format(format).to_string()));
    }
    Ok(value.clone())
}

fn error_chain(e: &dyn std::error::Error) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn not_found_fragment(template: &str) -> String {
    format!("<h1>模板未找到</h1><p>{}</p>", tera::escape_html(template))
}

/// 只展示模板名，错误详情只写日志
fn error_fragment(template: &str) -> String {
    format!("<h1>模板渲染错误</h1><p>{}</p>", tera::escape_html(template))
}

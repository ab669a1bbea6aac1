//! 扩展路由挂载。
//!
//! 路由只在启动时挂载一次，之后新激活扩展的路由需要重启进程才会生效。

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use axum::extract::Path;
use axum::http::{Method, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{on, MethodFilter};
use axum::Router;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::models::{CustomPage, ExtensionId, Manifest};
use crate::plugins::runtime::{guarded, mount_key};
use crate::plugins::{panic_message, ExtensionError, ExtensionRuntime, LoadedExtension};
use crate::theme::ThemeRenderer;
use crate::utils::{normalize_route_pattern, slugify};

/// 把已加载扩展的路由组和自定义页面挂载到路由器上
pub struct RouteMounter {
    runtime: Arc<ExtensionRuntime>,
    renderer: Arc<ThemeRenderer>,
}

impl RouteMounter {
    pub fn new(runtime: Arc<ExtensionRuntime>, renderer: Arc<ThemeRenderer>) -> Self {
        Self { runtime, renderer }
    }

    /// 挂载路由，同一个运行时只能调用一次
    pub fn mount_routes(&self, mut router: Router) -> Result<Router, ExtensionError> {
        self.runtime.begin_mount()?;

        let mut groups = 0;
        let mut pages = 0;
        for extension in self.runtime.loaded_extensions() {
            let (r, mounted) = self.mount_groups(router, &extension);
            router = r;
            groups += mounted;

            for page in self.collect_pages(&extension) {
                let (r, mounted) = self.mount_page(router, &extension.id, page);
                router = r;
                if mounted {
                    pages += 1;
                }
            }
        }

        info!("扩展路由挂载完成 - 路由组: {}, 自定义页面: {}", groups, pages);
        Ok(router)
    }

    fn mount_groups(&self, mut router: Router, extension: &LoadedExtension) -> (Router, usize) {
        let Some(instance) = &extension.instance else {
            return (router, 0);
        };

        let mut mounted = 0;
        for group in guarded(&extension.id, "route_groups", || instance.route_groups()) {
            let key = mount_key(&extension.id, &group.name);
            if !self.runtime.mark_mounted(key.clone()) {
                warn!("路由组 {} 已挂载，跳过", key);
                continue;
            }
            match try_merge(&router, group.router) {
                Ok(merged) => {
                    router = merged;
                    mounted += 1;
                    info!("已挂载扩展 {} 的路由组 {}", extension.id, group.name);
                }
                Err(message) => error!("挂载路由组 {} 失败，与已有路由冲突: {}", key, message),
            }
        }
        (router, mounted)
    }

    /// 扩展代码声明的页面在前，清单中声明的页面在后
    fn collect_pages(&self, extension: &LoadedExtension) -> Vec<CustomPage> {
        let mut pages = match &extension.instance {
            Some(instance) => guarded(&extension.id, "custom_pages", || instance.custom_pages()),
            None => Vec::new(),
        };
        match Manifest::load(extension.id.kind, &extension.record.install_path) {
            Ok(manifest) => pages.extend(manifest.custom_pages),
            Err(e) => debug!("读取扩展 {} 的清单失败: {}", extension.id, e),
        }
        pages
    }

    fn mount_page(&self, router: Router, owner: &ExtensionId, page: CustomPage) -> (Router, bool) {
        let pattern = normalize_route_pattern(&page.route);
        if !self.runtime.mark_mounted(format!("page:{}", pattern)) {
            warn!("自定义页面路由 {} 已被其他扩展占用，跳过 {}", pattern, owner);
            return (router, false);
        }

        let Some(filter) = method_filter(&page.methods) else {
            warn!("自定义页面 {} 的请求方法无效: {:?}", pattern, page.methods);
            return (router, false);
        };

        let endpoint = page
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("{}.{}", owner.namespace(), slugify(&page.route)));
        self.renderer.urls().register(&endpoint, &pattern);

        let int_params = int_params(&page.route);
        let handler = {
            let runtime = Arc::clone(&self.runtime);
            let renderer = Arc::clone(&self.renderer);
            let owner = owner.clone();
            let page = Arc::new(page);
            move |params: Option<Path<HashMap<String, String>>>| {
                let runtime = Arc::clone(&runtime);
                let renderer = Arc::clone(&renderer);
                let owner = owner.clone();
                let page = Arc::clone(&page);
                let int_params = int_params.clone();
                async move {
                    let params = params.map(|Path(p)| p).unwrap_or_default();
                    serve_custom_page(&runtime, &renderer, &owner, &page, params, &int_params).await
                }
            }
        };

        let page_router = Router::new().route(&pattern, on(filter, handler));
        match try_merge(&router, page_router) {
            Ok(merged) => {
                info!("已挂载自定义页面 {} -> {}", pattern, endpoint);
                (merged, true)
            }
            Err(message) => {
                error!("挂载自定义页面 {} 失败: {}", pattern, message);
                (router, false)
            }
        }
    }
}

/// 路由冲突时 axum 会 panic，这里转换为错误
fn try_merge(router: &Router, other: Router) -> Result<Router, String> {
    let current = router.clone();
    catch_unwind(AssertUnwindSafe(move || current.merge(other))).map_err(|payload| panic_message(payload.as_ref()))
}

fn method_filter(methods: &[String]) -> Option<MethodFilter> {
    let mut filter: Option<MethodFilter> = None;
    for method in methods {
        let method = Method::from_bytes(method.trim().to_uppercase().as_bytes()).ok()?;
        let single = MethodFilter::try_from(method).ok()?;
        filter = Some(match filter {
            Some(existing) => existing.or(single),
            None => single,
        });
    }
    filter.or(Some(MethodFilter::GET))
}

/// `<int:id>` 形式声明的参数
fn int_params(route: &str) -> Vec<String> {
    route
        .split('/')
        .filter_map(|segment| segment.strip_prefix("<int:").and_then(|s| s.strip_suffix('>')))
        .map(str::to_string)
        .collect()
}

async fn serve_custom_page(
    runtime: &ExtensionRuntime,
    renderer: &ThemeRenderer,
    owner: &ExtensionId,
    page: &CustomPage,
    params: HashMap<String, String>,
    int_params: &[String],
) -> Response {
    if !runtime.is_active(owner) {
        debug!("自定义页面 {} 的扩展 {} 未激活", page.route, owner);
        return renderer.render_status("404.html", Map::new(), StatusCode::NOT_FOUND).await;
    }

    let mut context = page.context.clone();
    for (key, value) in params {
        let value = if int_params.contains(&key) {
            match value.parse::<i64>() {
                Ok(n) => json!(n),
                Err(_) => return renderer.render_status("404.html", Map::new(), StatusCode::NOT_FOUND).await,
            }
        } else {
            Value::String(value)
        };
        context.insert(key, value);
    }

    Html(renderer.render(&page.template, context).await).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_filter_defaults_to_get() {
        assert!(method_filter(&[]).is_some());
        assert!(method_filter(&["get".to_string(), "POST".to_string()]).is_some());
        assert!(method_filter(&["FETCH".to_string()]).is_none());
    }

    #[test]
    fn test_int_params() {
        assert_eq!(int_params("/posts/<int:id>/<slug>"), vec!["id".to_string()]);
        assert!(int_params("/about").is_empty());
    }
}

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Request, State};
use axum::http::{StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde_json::{json, Map};
use tower::ServiceExt;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::routes::RouteMounter;
use super::urls::UrlResolver;
use crate::models::Config;
use crate::plugins::hooks::{AFTER_REQUEST, BEFORE_REQUEST};
use crate::plugins::{register_builtin_extensions, ExtensionError, ExtensionRegistry, ExtensionRuntime};
use crate::theme::ThemeRenderer;
use crate::utils::is_safe_segment;

/// 请求处理共享的状态
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<ExtensionRuntime>,
    pub renderer: Arc<ThemeRenderer>,
    pub config: Arc<Config>,
}

impl AppState {
    /// 连接注册表、执行迁移，并按配置发现和加载扩展
    pub async fn bootstrap(base_dir: &Path, config: Config) -> Result<Self> {
        let registry = ExtensionRegistry::connect(&config.database_url, base_dir)
            .await
            .context("连接数据库失败")?;
        registry.migrate().await.context("数据库迁移失败")?;

        let runtime = Arc::new(ExtensionRuntime::new(registry, &config));
        register_builtin_extensions(&runtime);

        if config.skip_extension_init {
            info!("已跳过扩展初始化");
        } else {
            if let Err(e) = runtime.discover_all().await {
                warn!("扫描扩展目录失败: {}", e);
            }
            if let Err(e) = runtime.ensure_default_theme().await {
                warn!("激活默认主题失败: {}", e);
            }
            runtime.load_all().await;
        }

        Ok(Self::new(runtime, config))
    }

    pub fn new(runtime: Arc<ExtensionRuntime>, config: Config) -> Self {
        let urls = Arc::new(UrlResolver::new());
        let renderer = Arc::new(ThemeRenderer::new(Arc::clone(&runtime), urls, config.clone()));
        Self {
            runtime,
            renderer,
            config: Arc::new(config),
        }
    }
}

/// 构建应用路由：核心路由、扩展路由，最后是中间件
pub fn build_router(state: &AppState) -> Result<Router, ExtensionError> {
    let core = Router::new()
        .route("/", get(index))
        .route("/themes/:theme/static/*path", get(theme_static))
        .route("/static/plugins/:plugin/*path", get(plugin_static))
        .fallback(not_found)
        .with_state(state.clone());

    let router = RouteMounter::new(Arc::clone(&state.runtime), Arc::clone(&state.renderer)).mount_routes(core)?;

    Ok(router
        .layer(middleware::from_fn_with_state(state.clone(), extension_middleware))
        .layer(TraceLayer::new_for_http()))
}

/// 每个请求前与注册表对账，并触发请求钩子
async fn extension_middleware(State(state): State<AppState>, request: Request, next: Next) -> Response {
    state.runtime.reconcile().await;

    let path = request.uri().path().to_string();
    state.runtime.hooks().do_action(BEFORE_REQUEST, &[json!(path)]);

    let response = next.run(request).await;

    state
        .runtime
        .hooks()
        .do_action(AFTER_REQUEST, &[json!(response.status().as_u16())]);
    response
}

async fn index(State(state): State<AppState>) -> Html<String> {
    Html(state.renderer.render("index.html", Map::new()).await)
}

async fn not_found(State(state): State<AppState>, uri: Uri) -> Response {
    let mut context = Map::new();
    context.insert("path".to_string(), json!(uri.path()));
    state.renderer.render_status("404.html", context, StatusCode::NOT_FOUND).await
}

async fn theme_static(
    State(state): State<AppState>,
    axum::extract::Path((theme, _)): axum::extract::Path<(String, String)>,
    request: Request,
) -> Response {
    let root = state.runtime.themes_dir().join(&theme).join("static");
    serve_static(&theme, root, request).await
}

async fn plugin_static(
    State(state): State<AppState>,
    axum::extract::Path((plugin, _)): axum::extract::Path<(String, String)>,
    request: Request,
) -> Response {
    let root = state.runtime.plugins_dir().join(&plugin).join("static");
    serve_static(&plugin, root, request).await
}

/// 两种静态路由的前缀都是三段，剩余部分原样交给 ServeDir
async fn serve_static(name: &str, root: PathBuf, mut request: Request) -> Response {
    if !is_safe_segment(name) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let rest = request.uri().path().splitn(5, '/').nth(4).unwrap_or_default().to_string();
    let uri = match format!("/{}", rest).parse::<Uri>() {
        Ok(uri) => uri,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };
    *request.uri_mut() = uri;

    match ServeDir::new(root).oneshot(request).await {
        Ok(response) => response.into_response(),
        Err(e) => match e {},
    }
}

/// HTTP 服务器
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// 挂载路由并启动服务器
    pub async fn start(self) -> Result<()> {
        let app = build_router(&self.state)?;

        let addr: SocketAddr = format!("{}:{}", self.state.config.host, self.state.config.port).parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("服务器已启动: http://localhost:{}", self.state.config.port);
        axum::serve(listener, app).await?;
        Ok(())
    }
}

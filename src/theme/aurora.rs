//! Aurora 主题的后端部分：状态接口和时间线页面。

use anyhow::Result;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::models::CustomPage;
use crate::plugins::hooks::TEMPLATE_CONTEXT;
use crate::plugins::{Extension, ExtensionContext, RouteGroup};

const VERSION: &str = "1.0.0";

#[derive(Default)]
pub struct AuroraTheme;

impl Extension for AuroraTheme {
    fn name(&self) -> &str {
        "aurora"
    }

    fn version(&self) -> &str {
        VERSION
    }

    fn register(&self, ctx: &mut ExtensionContext<'_>) -> Result<()> {
        let accent = ctx
            .config()
            .get("accent_color")
            .and_then(Value::as_str)
            .unwrap_or("#6c5ce7")
            .to_string();
        ctx.add_filter(TEMPLATE_CONTEXT, 20, 1, move |mut context, _| {
            if let Some(map) = context.as_object_mut() {
                map.entry("aurora").or_insert_with(|| json!({ "accent_color": accent }));
            }
            Ok(context)
        });
        Ok(())
    }

    fn route_groups(&self) -> Vec<RouteGroup> {
        let router = Router::new().route(
            "/admin/theme/aurora/status",
            get(|| async { Json(json!({ "theme": "aurora", "version": VERSION, "status": "ok" })) }),
        );
        vec![RouteGroup::new("aurora_admin", router)]
    }

    fn custom_pages(&self) -> Vec<CustomPage> {
        vec![CustomPage::new("/aurora/timeline", "pages/timeline.html")
            .with_endpoint("aurora-timeline")
            .with_context("page_title", json!("时间线"))]
    }

    fn default_config(&self) -> Option<Value> {
        Some(json!({ "accent_color": "#6c5ce7", "show_timeline": true }))
    }
}

use anyhow::Result;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use tracing::debug;

use super::hooks::{ADMIN_NAVIGATION, AFTER_REQUEST, BEFORE_REQUEST, SIDEBAR_BOTTOM, TEMPLATE_CONTEXT};
use super::{Extension, ExtensionContext, HookDescriptor, RouteGroup};

const DEFAULT_MESSAGE: &str = "Hello World!";

/// Hello World 示例插件
#[derive(Default)]
pub struct HelloWorldPlugin;

impl HelloWorldPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl Extension for HelloWorldPlugin {
    fn name(&self) -> &str {
        "hello_world"
    }

    fn description(&self) -> &str {
        "一个简单的Hello World示例插件"
    }

    fn register(&self, ctx: &mut ExtensionContext<'_>) -> Result<()> {
        let config = ctx.config().clone();
        let message = config
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_MESSAGE)
            .to_string();

        let context_message = message.clone();
        ctx.add_filter(TEMPLATE_CONTEXT, 10, 1, move |mut context, _| {
            if let Some(map) = context.as_object_mut() {
                map.insert("hello_world_message".to_string(), json!(context_message));
            }
            Ok(context)
        });

        let add_prefix = config.get("add_prefix").and_then(Value::as_bool).unwrap_or(false);
        ctx.add_filter("page_title", 10, 1, move |title, _| {
            if !add_prefix {
                return Ok(title);
            }
            Ok(json!(format!("👋 {}", title.as_str().unwrap_or_default())))
        });

        let append_message = config.get("append_message").and_then(Value::as_bool).unwrap_or(false);
        ctx.add_filter("post_content", 10, 2, move |content, _| {
            if !append_message {
                return Ok(content);
            }
            let body = content.as_str().unwrap_or_default();
            Ok(json!(format!("{}\n\n<p><em>{}</em></p>", body, message)))
        });

        if config.get("show_in_footer").and_then(Value::as_bool).unwrap_or(true) {
            let footer = config
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_MESSAGE)
                .to_string();
            ctx.add_template_hook(SIDEBAR_BOTTOM, 10, move || {
                Ok(json!(format!("<div class=\"hello-world\">{}</div>", tera::escape_html(&footer))))
            });
        }
        Ok(())
    }

    fn describe_hooks(&self) -> Vec<HookDescriptor> {
        vec![
            HookDescriptor::action(BEFORE_REQUEST, |args| {
                debug!("hello_world: before_request {:?}", args.first());
                Ok(())
            }),
            HookDescriptor::action(AFTER_REQUEST, |args| {
                debug!("hello_world: after_request {:?}", args.first());
                Ok(())
            }),
            HookDescriptor::filter(ADMIN_NAVIGATION, |mut items, _| {
                if let Some(list) = items.as_array_mut() {
                    list.push(json!({
                        "name": "hello_world",
                        "title": "Hello World",
                        "url": "/admin/hello_world",
                        "icon": "el-icon-chat-dot-round",
                    }));
                }
                Ok(items)
            }),
        ]
    }

    fn route_groups(&self) -> Vec<RouteGroup> {
        let router = Router::new()
            .route("/hello_world", get(|| async { Html(format!("<p>{}</p>", DEFAULT_MESSAGE)) }))
            .route("/admin/hello_world", get(admin_page));
        vec![RouteGroup::new("hello_world", router)]
    }

    fn default_config(&self) -> Option<Value> {
        Some(json!({
            "message": "Hello from HelloWorld Plugin!",
            "show_in_footer": true,
        }))
    }
}

async fn admin_page() -> Html<String> {
    let plugin = HelloWorldPlugin::new();
    Html(format!(
        "<div class=\"plugin-admin\"><h2>Hello World 插件设置</h2>\
         <p>这是一个示例插件的管理页面。</p><p>插件版本: {}</p><p>描述: {}</p></div>",
        plugin.version(),
        plugin.description()
    ))
}

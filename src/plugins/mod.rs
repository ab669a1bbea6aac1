//! 插件/主题扩展运行时：注册表、钩子总线、模块加载器与多进程对账。

use anyhow::Result;
use serde_json::Value;

use crate::models::{CustomPage, ExtensionId, ExtensionRecord};

mod error;
pub mod hello_world;
pub mod hooks;
pub mod loader;
pub mod registry;
pub mod runtime;

pub use error::*;
pub use hooks::{HookBus, HookCallback, HookOptions};
pub use loader::{ExtensionFactory, LoadedExtension, ModuleLoader};
pub use registry::ExtensionRegistry;
pub use runtime::{ExtensionRuntime, ReconcileOutcome};

/// 注册随程序编译的内置扩展
pub fn register_builtin_extensions(runtime: &ExtensionRuntime) {
    runtime.register_factory(ExtensionId::plugin("hello_world"), || {
        Ok(Box::new(hello_world::HelloWorldPlugin::new()))
    });
    runtime.register_factory(ExtensionId::theme("aurora"), || {
        Ok(Box::new(crate::theme::aurora::AuroraTheme))
    });
}

/// 扩展贡献的一组路由，挂载时按 `扩展:名称` 去重
pub struct RouteGroup {
    pub name: String,
    pub router: axum::Router,
}

impl RouteGroup {
    pub fn new(name: impl Into<String>, router: axum::Router) -> Self {
        Self { name: name.into(), router }
    }
}

/// 声明式钩子描述
#[derive(Clone)]
pub struct HookDescriptor {
    pub name: String,
    pub priority: i32,
    pub accepted_args: usize,
    pub callback: HookCallback,
}

impl HookDescriptor {
    pub fn new(name: impl Into<String>, callback: HookCallback) -> Self {
        Self {
            name: name.into(),
            priority: hooks::DEFAULT_PRIORITY,
            accepted_args: 1,
            callback,
        }
    }

    pub fn action<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<()> + Send + Sync + 'static,
    {
        Self::new(name, HookCallback::action(f))
    }

    pub fn filter<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        Self::new(name, HookCallback::filter(f))
    }

    pub fn template<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Result<Value> + Send + Sync + 'static,
    {
        Self::new(name, HookCallback::template(f))
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn accepted_args(mut self, accepted_args: usize) -> Self {
        self.accepted_args = accepted_args;
        self
    }
}

/// 扩展注册时拿到的上下文，注册的钩子自动归属于该扩展
pub struct ExtensionContext<'a> {
    record: &'a ExtensionRecord,
    hooks: &'a HookBus,
    owner: String,
}

impl<'a> ExtensionContext<'a> {
    pub fn new(record: &'a ExtensionRecord, hooks: &'a HookBus) -> Self {
        Self {
            owner: record.extension_id().namespace(),
            record,
            hooks,
        }
    }

    pub fn id(&self) -> ExtensionId {
        self.record.extension_id()
    }

    pub fn record(&self) -> &ExtensionRecord {
        self.record
    }

    /// 注册表中保存的配置
    pub fn config(&self) -> &Value {
        &self.record.config_data
    }

    pub fn register_hook(&mut self, name: &str, callback: HookCallback, options: HookOptions) {
        self.hooks.register_hook(name, callback, options.owner(self.owner.clone()));
    }

    pub fn add_action<F>(&mut self, name: &str, priority: i32, accepted_args: usize, f: F)
    where
        F: Fn(&[Value]) -> Result<()> + Send + Sync + 'static,
    {
        let options = HookOptions::default().priority(priority).accepted_args(accepted_args);
        self.register_hook(name, HookCallback::action(f), options);
    }

    pub fn add_filter<F>(&mut self, name: &str, priority: i32, accepted_args: usize, f: F)
    where
        F: Fn(Value, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        let options = HookOptions::default().priority(priority).accepted_args(accepted_args);
        self.register_hook(name, HookCallback::filter(f), options);
    }

    pub fn add_template_hook<F>(&mut self, name: &str, priority: i32, f: F)
    where
        F: Fn() -> Result<Value> + Send + Sync + 'static,
    {
        self.hooks.register_template_hook(name, f, priority, Some(&self.owner));
    }

    pub fn register_descriptor(&mut self, descriptor: HookDescriptor) {
        let options = HookOptions::default()
            .priority(descriptor.priority)
            .accepted_args(descriptor.accepted_args);
        self.register_hook(&descriptor.name, descriptor.callback, options);
    }
}

/// 扩展特征，插件与主题后端都实现它
///
/// 编译期内置的扩展通过 [`ModuleLoader::register_factory`] 注册工厂，
/// 动态库扩展用 [`export_extension!`](crate::export_extension) 导出 `create_extension`。
pub trait Extension: Send + Sync {
    /// 扩展名称
    fn name(&self) -> &str;

    /// 扩展版本
    fn version(&self) -> &str {
        "1.0.0"
    }

    fn description(&self) -> &str {
        ""
    }

    /// 显式注册钩子
    fn register(&self, _ctx: &mut ExtensionContext<'_>) -> Result<()> {
        Ok(())
    }

    /// 声明式钩子列表，在 `register` 之后注册
    fn describe_hooks(&self) -> Vec<HookDescriptor> {
        Vec::new()
    }

    /// 需要在服务启动前挂载的路由
    fn route_groups(&self) -> Vec<RouteGroup> {
        Vec::new()
    }

    fn custom_pages(&self) -> Vec<CustomPage> {
        Vec::new()
    }

    /// 安装时写入的默认配置
    fn default_config(&self) -> Option<Value> {
        None
    }

    fn on_install(&self) -> Result<()> {
        Ok(())
    }

    fn on_activate(&self) -> Result<()> {
        Ok(())
    }

    fn on_deactivate(&self) -> Result<()> {
        Ok(())
    }

    fn on_uninstall(&self) -> Result<()> {
        Ok(())
    }
}

/// 为动态库扩展导出 `create_extension` 入口
#[macro_export]
macro_rules! export_extension {
    ($ty:ty) => {
        #[no_mangle]
        pub fn create_extension() -> Box<dyn $crate::plugins::Extension> {
            Box::new(<$ty>::default())
        }
    };
}

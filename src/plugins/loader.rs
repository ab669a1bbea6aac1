use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use libloading::{Library, Symbol};
use tracing::{debug, error, info, warn};

use super::error::{panic_message, ExtensionError};
use super::hooks::HookBus;
use super::{Extension, ExtensionContext};
use crate::models::{ExtensionId, ExtensionKind, ExtensionRecord};

/// 编译期内置扩展的工厂函数
pub type ExtensionFactory = Arc<dyn Fn() -> Result<Box<dyn Extension>> + Send + Sync>;

/// 动态库导出的入口函数签名
type CreateExtension = unsafe fn() -> Box<dyn Extension>;

/// 入口符号名
const ENTRY_SYMBOL: &[u8] = b"create_extension";

/// 已加载的扩展
#[derive(Clone)]
pub struct LoadedExtension {
    pub id: ExtensionId,
    pub record: ExtensionRecord,
    /// 只有模板的主题没有代码实例
    pub instance: Option<Arc<dyn Extension>>,
}

/// 模块加载器：按命名空间实例化扩展并执行注册
pub struct ModuleLoader {
    factories: HashMap<ExtensionId, ExtensionFactory>,
    libraries: HashMap<PathBuf, Library>,
}

impl Default for ModuleLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ModuleLoader {
    fn drop(&mut self) {
        // 动态库不卸载：钩子闭包和扩展实例可能比加载器活得更久
        for (_, library) in self.libraries.drain() {
            std::mem::forget(library);
        }
    }
}

impl ModuleLoader {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            libraries: HashMap::new(),
        }
    }

    /// 注册内置扩展工厂
    pub fn register_factory<F>(&mut self, id: ExtensionId, factory: F)
    where
        F: Fn() -> Result<Box<dyn Extension>> + Send + Sync + 'static,
    {
        debug!("注册扩展工厂: {}", id);
        self.factories.insert(id, Arc::new(factory));
    }

    pub fn has_factory(&self, id: &ExtensionId) -> bool {
        self.factories.contains_key(id)
    }

    /// 创建扩展实例，没有入口时返回 `None`
    pub fn instantiate(&mut self, record: &ExtensionRecord) -> Result<Option<Box<dyn Extension>>, ExtensionError> {
        let id = record.extension_id();

        if let Some(factory) = self.factories.get(&id).cloned() {
            return match catch_unwind(AssertUnwindSafe(|| factory())) {
                Ok(Ok(instance)) => Ok(Some(instance)),
                Ok(Err(e)) => Err(ExtensionError::LoadError {
                    name: id.to_string(),
                    message: format!("创建实例失败: {:#}", e),
                }),
                Err(payload) => Err(ExtensionError::LoadError {
                    name: id.to_string(),
                    message: format!("创建实例时发生严重错误: {}", panic_message(payload.as_ref())),
                }),
            };
        }

        match record.entry.as_deref() {
            Some(entry) => self.load_from_library(record, entry).map(Some),
            None => Ok(None),
        }
    }

    /// 从动态链接库加载扩展
    fn load_from_library(&mut self, record: &ExtensionRecord, entry: &str) -> Result<Box<dyn Extension>, ExtensionError> {
        let name = record.extension_id().to_string();
        if !is_relative_inside(Path::new(entry)) {
            return Err(ExtensionError::LoadError {
                name,
                message: format!("入口路径不合法: {}", entry),
            });
        }

        let lib_path = record.install_path.join(entry);
        if !lib_path.is_file() {
            return Err(ExtensionError::LoadError {
                name,
                message: format!("扩展库文件不存在: {}", lib_path.display()),
            });
        }

        if !self.libraries.contains_key(&lib_path) {
            info!("从动态链接库加载扩展: {}", lib_path.display());
            let library = match catch_unwind(|| unsafe { Library::new(&lib_path) }) {
                Ok(Ok(library)) => library,
                Ok(Err(e)) => {
                    return Err(ExtensionError::LoadError {
                        name,
                        message: format!("无法加载库 {}: {}", lib_path.display(), e),
                    });
                }
                Err(_) => {
                    return Err(ExtensionError::LoadError {
                        name,
                        message: format!("加载库时发生严重错误，可能是ABI不兼容: {}", lib_path.display()),
                    });
                }
            };
            self.libraries.insert(lib_path.clone(), library);
        }

        let library = self.libraries.get(&lib_path).ok_or_else(|| ExtensionError::LoadError {
            name: name.clone(),
            message: "库句柄丢失".to_string(),
        })?;

        let constructor: Symbol<CreateExtension> = unsafe { library.get(ENTRY_SYMBOL) }.map_err(|e| {
            ExtensionError::LoadError {
                name: name.clone(),
                message: format!("找不到 create_extension 函数: {}", e),
            }
        })?;

        match catch_unwind(AssertUnwindSafe(|| unsafe { constructor() })) {
            Ok(instance) => Ok(instance),
            Err(payload) => Err(ExtensionError::LoadError {
                name,
                message: format!("调用 create_extension 时发生严重错误: {}", panic_message(payload.as_ref())),
            }),
        }
    }

    /// 加载单个扩展并注册其钩子
    ///
    /// 注册失败时回滚该扩展已注册的钩子。插件没有入口是错误，
    /// 主题没有入口则作为纯模板主题加载。
    pub fn load(&mut self, record: &ExtensionRecord, hooks: &HookBus) -> Result<LoadedExtension, ExtensionError> {
        let id = record.extension_id();

        if !record.install_path.exists() {
            return Err(ExtensionError::LoadError {
                name: id.to_string(),
                message: format!("扩展路径不存在: {}", record.install_path.display()),
            });
        }

        let instance = match self.instantiate(record)? {
            Some(instance) => instance,
            None if id.kind == ExtensionKind::Theme => {
                debug!("主题 {} 没有代码入口，按纯模板主题加载", id.name);
                return Ok(LoadedExtension { id, record: record.clone(), instance: None });
            }
            None => return Err(ExtensionError::MissingEntry { name: id.to_string() }),
        };

        let owner = id.namespace();
        let registered = catch_unwind(AssertUnwindSafe(|| -> Result<()> {
            let mut ctx = ExtensionContext::new(record, hooks);
            instance.register(&mut ctx)?;
            for descriptor in instance.describe_hooks() {
                ctx.register_descriptor(descriptor);
            }
            Ok(())
        }));

        let failure = match registered {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(payload) => Some(format!("注册时发生严重错误: {}", panic_message(payload.as_ref()))),
        };
        if let Some(message) = failure {
            let removed = hooks.remove_owner(&owner);
            debug!("回滚扩展 {} 的 {} 个钩子", id, removed);
            return Err(ExtensionError::InitError { name: id.to_string(), message });
        }

        Ok(LoadedExtension {
            id,
            record: record.clone(),
            instance: Some(Arc::from(instance)),
        })
    }

    /// 依次加载一批扩展，单个失败不影响其他扩展
    pub fn load_all(&mut self, records: &[ExtensionRecord], hooks: &HookBus) -> Vec<LoadedExtension> {
        let mut loaded = Vec::new();
        let mut failed = Vec::new();

        for record in records {
            match self.load(record, hooks) {
                Ok(extension) => {
                    info!("扩展 {} v{} 加载成功", extension.id, record.version);
                    loaded.push(extension);
                }
                Err(ExtensionError::MissingEntry { name }) => {
                    warn!("扩展 {} 中未找到入口，已跳过", name);
                    failed.push(name);
                }
                Err(e) => {
                    error!("加载扩展 {} 失败: {}", record.extension_id(), e);
                    failed.push(record.extension_id().to_string());
                }
            }
        }

        if !failed.is_empty() {
            warn!("以下扩展加载失败:");
            for name in &failed {
                warn!("  - {}", name);
            }
        }
        info!("扩展加载完成 - 成功: {}, 失败: {}", loaded.len(), failed.len());
        loaded
    }
}

/// 入口路径必须是扩展目录内的相对路径
fn is_relative_inside(path: &Path) -> bool {
    !path.as_os_str().is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::plugins::HookDescriptor;
    use anyhow::anyhow;
    use chrono::Utc;
    use serde_json::{json, Value};

    struct Greeter;

    impl Extension for Greeter {
        fn name(&self) -> &str {
            "greeter"
        }

        fn register(&self, ctx: &mut ExtensionContext<'_>) -> Result<()> {
            ctx.add_filter("page_title", 10, 1, |v, _| Ok(json!(format!("{}!", v.as_str().unwrap_or("")))));
            Ok(())
        }

        fn describe_hooks(&self) -> Vec<HookDescriptor> {
            vec![HookDescriptor::template("sidebar_bottom", || Ok(json!("<p>hi</p>")))]
        }
    }

    struct HalfRegistered;

    impl Extension for HalfRegistered {
        fn name(&self) -> &str {
            "half"
        }

        fn register(&self, ctx: &mut ExtensionContext<'_>) -> Result<()> {
            ctx.add_action("before_request", 10, 0, |_| Ok(()));
            Err(anyhow!("数据库表不存在"))
        }
    }

    pub(crate) fn record(kind: ExtensionKind, name: &str, path: &Path) -> ExtensionRecord {
        ExtensionRecord {
            id: 1,
            kind,
            name: name.to_string(),
            display_name: name.to_string(),
            description: None,
            version: "1.0.0".to_string(),
            author: None,
            author_website: None,
            license: None,
            min_version: None,
            max_version: None,
            is_active: true,
            is_system: false,
            install_path: path.to_path_buf(),
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
    fn test_load_registers_explicit_and_declared_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = ModuleLoader::new();
        loader.register_factory(ExtensionId::plugin("greeter"), || Ok(Box::new(Greeter)));
        let hooks = HookBus::new();

        let loaded = loader.load(&record(ExtensionKind::Plugin, "greeter", dir.path()), &hooks).unwrap();
        assert!(loaded.instance.is_some());
        assert_eq!(hooks.apply_filters("page_title", json!("首页"), &[]), json!("首页!"));
        assert_eq!(hooks.get_template_hooks("sidebar_bottom").len(), 1);
        assert_eq!(hooks.registrations("plugin:greeter").len(), 2);
    }

    #[test]
    fn test_missing_path_is_load_error() {
        let mut loader = ModuleLoader::new();
        loader.register_factory(ExtensionId::plugin("greeter"), || Ok(Box::new(Greeter)));
        let result = loader.load(
            &record(ExtensionKind::Plugin, "greeter", Path::new("/nonexistent/greeter")),
            &HookBus::new(),
        );
        assert!(matches!(result, Err(ExtensionError::LoadError { .. })));
    }

    #[test]
    fn test_plugin_without_entry_is_skipped_but_theme_is_template_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = ModuleLoader::new();
        let hooks = HookBus::new();

        let plugin = loader.load(&record(ExtensionKind::Plugin, "bare", dir.path()), &hooks);
        assert!(matches!(plugin, Err(ExtensionError::MissingEntry { .. })));

        let theme = loader.load(&record(ExtensionKind::Theme, "bare", dir.path()), &hooks).unwrap();
        assert!(theme.instance.is_none());
    }

    #[test]
    fn test_failed_registration_rolls_back_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = ModuleLoader::new();
        loader.register_factory(ExtensionId::plugin("half"), || Ok(Box::new(HalfRegistered)));
        let hooks = HookBus::new();

        let result = loader.load(&record(ExtensionKind::Plugin, "half", dir.path()), &hooks);
        assert!(matches!(result, Err(ExtensionError::InitError { .. })));
        assert!(hooks.is_empty());
    }

    #[test]
    fn test_broken_factory_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = ModuleLoader::new();
        loader.register_factory(ExtensionId::plugin("broken"), || Err(anyhow!("构造失败")));
        loader.register_factory(ExtensionId::plugin("panics"), || panic!("构造时崩溃"));
        loader.register_factory(ExtensionId::plugin("greeter"), || Ok(Box::new(Greeter)));
        let hooks = HookBus::new();

        let records = vec![
            record(ExtensionKind::Plugin, "broken", dir.path()),
            record(ExtensionKind::Plugin, "panics", dir.path()),
            record(ExtensionKind::Plugin, "greeter", dir.path()),
        ];
        let loaded = loader.load_all(&records, &hooks);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, ExtensionId::plugin("greeter"));
    }

    #[test]
    fn test_library_entry_must_stay_inside_extension_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = ModuleLoader::new();
        let mut rec = record(ExtensionKind::Plugin, "escape", dir.path());
        rec.entry = Some("../libevil.so".to_string());

        let result = loader.load(&rec, &HookBus::new());
        assert!(matches!(result, Err(ExtensionError::LoadError { .. })));

        rec.entry = Some("libmissing.so".to_string());
        let result = loader.load(&rec, &HookBus::new());
        assert!(matches!(result, Err(ExtensionError::LoadError { .. })));
    }

    #[test]
    fn test_namespaces_keep_plugin_and_theme_apart() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = ModuleLoader::new();
        loader.register_factory(ExtensionId::plugin("shared"), || Ok(Box::new(Greeter)));
        assert!(loader.has_factory(&ExtensionId::plugin("shared")));
        assert!(!loader.has_factory(&ExtensionId::theme("shared")));

        let theme = loader.load(&record(ExtensionKind::Theme, "shared", dir.path()), &HookBus::new()).unwrap();
        assert!(theme.instance.is_none());
    }
}

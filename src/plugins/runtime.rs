//! 扩展运行时：加载、对账与管理操作。
//!
//! 每个工作进程持有一个 [`ExtensionRuntime`]，钩子总线和已加载扩展都是进程内缓存，
//! 随时可以从注册表和文件系统重建。

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::error::{panic_message, ExtensionError};
use super::hooks::HookBus;
use super::loader::{LoadedExtension, ModuleLoader};
use super::registry::ExtensionRegistry;
use super::Extension;
use crate::models::{Config, ExtensionId, ExtensionKind, ExtensionRecord};

/// 一次对账的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// 激活集合未变化
    Unchanged,
    /// 已完整重载
    Reloaded,
    /// 注册表不可用，本次跳过
    Skipped,
}

/// 一次加载的结果，重载时整体替换
#[derive(Default)]
struct LoadedState {
    hooks: Arc<HookBus>,
    extensions: BTreeMap<ExtensionId, LoadedExtension>,
    /// 加载时的激活集合，`None` 表示尚未加载
    snapshot: Option<BTreeSet<ExtensionId>>,
    generation: u64,
}

/// 扩展运行时
pub struct ExtensionRuntime {
    registry: ExtensionRegistry,
    loader: Mutex<ModuleLoader>,
    state: RwLock<Arc<LoadedState>>,
    mounted: Mutex<HashSet<String>>,
    routes_mounted: AtomicBool,
    reload_lock: tokio::sync::Mutex<()>,
    reloads: AtomicUsize,
    app_version: String,
    default_theme: String,
    plugins_dir: PathBuf,
    themes_dir: PathBuf,
}

impl ExtensionRuntime {
    pub fn new(registry: ExtensionRegistry, config: &Config) -> Self {
        let base_dir = registry.base_dir().to_path_buf();
        Self {
            loader: Mutex::new(ModuleLoader::new()),
            state: RwLock::new(Arc::default()),
            mounted: Mutex::new(HashSet::new()),
            routes_mounted: AtomicBool::new(false),
            reload_lock: tokio::sync::Mutex::new(()),
            reloads: AtomicUsize::new(0),
            app_version: config.app_version.clone(),
            default_theme: config.default_theme.clone(),
            plugins_dir: config.plugins_path(&base_dir),
            themes_dir: config.themes_path(&base_dir),
            registry,
        }
    }

    pub fn registry(&self) -> &ExtensionRegistry {
        &self.registry
    }

    /// 当前生效的钩子总线，重载期间仍返回上一次加载的结果
    pub fn hooks(&self) -> Arc<HookBus> {
        Arc::clone(&self.state().hooks)
    }

    fn state(&self) -> Arc<LoadedState> {
        Arc::clone(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn app_version(&self) -> &str {
        &self.app_version
    }

    pub fn default_theme(&self) -> &str {
        &self.default_theme
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    pub fn themes_dir(&self) -> &Path {
        &self.themes_dir
    }

    /// 注册编译期内置的扩展工厂
    pub fn register_factory<F>(&self, id: ExtensionId, factory: F)
    where
        F: Fn() -> anyhow::Result<Box<dyn Extension>> + Send + Sync + 'static,
    {
        self.loader().register_factory(id, factory);
    }

    /// 扫描插件和主题目录
    pub async fn discover_all(&self) -> Result<Vec<ExtensionId>, ExtensionError> {
        let mut found = Vec::new();
        for name in self.registry.discover(ExtensionKind::Plugin, &self.plugins_dir).await? {
            found.push(ExtensionId::plugin(name));
        }
        for name in self.registry.discover(ExtensionKind::Theme, &self.themes_dir).await? {
            found.push(ExtensionId::theme(name));
        }
        Ok(found)
    }

    /// 没有激活主题时激活默认主题
    pub async fn ensure_default_theme(&self) -> Result<bool, ExtensionError> {
        let themes = self.registry.list(ExtensionKind::Theme).await?;
        if themes.iter().any(|t| t.is_active) {
            return Ok(false);
        }
        if !themes.iter().any(|t| t.name == self.default_theme) {
            warn!("默认主题 {} 未注册", self.default_theme);
            return Ok(false);
        }
        info!("没有激活的主题，激活默认主题 {}", self.default_theme);
        self.registry.activate(ExtensionKind::Theme, &self.default_theme).await
    }

    /// 按注册表的激活集合完整加载，注册表不可用时按没有激活扩展处理
    pub async fn load_all(&self) -> usize {
        let _guard = self.reload_lock.lock().await;
        let records = match self.registry.list_active().await {
            Ok(records) => records,
            Err(e) => {
                error!("读取激活扩展失败，按无扩展启动: {}", e);
                Vec::new()
            }
        };
        self.reload_from(records).await
    }

    /// 与注册表对账，激活集合变化时完整重载
    pub async fn reconcile(&self) -> ReconcileOutcome {
        let current = match self.registry.active_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("扩展对账失败，沿用当前状态: {}", e);
                return ReconcileOutcome::Skipped;
            }
        };
        if self.snapshot_matches(&current) {
            return ReconcileOutcome::Unchanged;
        }

        let _guard = self.reload_lock.lock().await;
        // 等锁期间可能已有其他请求完成了重载
        if self.snapshot_matches(&current) {
            return ReconcileOutcome::Unchanged;
        }

        let records = match self.registry.list_active().await {
            Ok(records) => records,
            Err(e) => {
                warn!("读取激活扩展失败，沿用当前状态: {}", e);
                return ReconcileOutcome::Skipped;
            }
        };
        info!("检测到扩展状态变化，重新加载扩展");
        self.reload_from(records).await;
        ReconcileOutcome::Reloaded
    }

    /// 强制重载当前进程，用于配置变化
    pub async fn reload(&self) -> Result<usize, ExtensionError> {
        let _guard = self.reload_lock.lock().await;
        let records = self.registry.list_active().await?;
        Ok(self.reload_from(records).await)
    }

    /// 在新的钩子总线上加载，完成后一次性替换，请求不会看到加载到一半的状态
    async fn reload_from(&self, records: Vec<ExtensionRecord>) -> usize {
        let ids: BTreeSet<ExtensionId> = records.iter().map(|r| r.extension_id()).collect();

        let hooks = Arc::new(HookBus::new());
        let loaded = self.loader().load_all(&records, &hooks);

        for extension in &loaded {
            let registrations = hooks.registrations(&extension.id.namespace());
            if let Err(e) = self.registry.record_hooks(extension.record.id, &registrations).await {
                warn!("记录扩展 {} 的钩子失败: {}", extension.id, e);
            }
        }

        self.warn_unmounted_routes(&loaded);

        let count = loaded.len();
        debug!("已加载 {} 个扩展，钩子 {} 个: {:?}", count, hooks.len(), hooks.hook_names());
        let next = LoadedState {
            hooks,
            extensions: loaded.into_iter().map(|e| (e.id.clone(), e)).collect(),
            snapshot: Some(ids),
            generation: self.generation() + 1,
        };
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        self.reloads.fetch_add(1, Ordering::SeqCst);
        count
    }

    fn snapshot_matches(&self, current: &BTreeSet<ExtensionId>) -> bool {
        self.state().snapshot.as_ref().is_some_and(|snapshot| snapshot == current)
    }

    /// 路由挂载后新激活的扩展不能再添加路由
    fn warn_unmounted_routes(&self, loaded: &[LoadedExtension]) {
        if !self.routes_mounted() {
            return;
        }
        let mounted = self.mounted.lock().unwrap_or_else(PoisonError::into_inner);
        for extension in loaded {
            let Some(instance) = &extension.instance else { continue };
            let groups = guarded(&extension.id, "route_groups", || instance.route_groups());
            let missing: Vec<String> = groups
                .into_iter()
                .map(|g| mount_key(&extension.id, &g.name))
                .filter(|key| !mounted.contains(key))
                .collect();
            if !missing.is_empty() {
                warn!("扩展 {} 的路由 {:?} 未挂载，需要重启进程后生效", extension.id, missing);
            }
        }
    }

    /// 完整重载的次数，包括首次加载
    pub fn reload_count(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    /// 每次重载递增，用于使模板缓存失效
    pub fn generation(&self) -> u64 {
        self.state().generation
    }

    pub fn is_active(&self, id: &ExtensionId) -> bool {
        self.state().snapshot.as_ref().is_some_and(|snapshot| snapshot.contains(id))
    }

    pub fn active_theme(&self) -> Option<ExtensionRecord> {
        self.state()
            .extensions
            .values()
            .find(|e| e.id.kind == ExtensionKind::Theme)
            .map(|e| e.record.clone())
    }

    pub fn loaded_extensions(&self) -> Vec<LoadedExtension> {
        self.state().extensions.values().cloned().collect()
    }

    pub fn loaded_ids(&self) -> Vec<ExtensionId> {
        self.state().extensions.keys().cloned().collect()
    }

    pub fn get_loaded(&self, id: &ExtensionId) -> Option<LoadedExtension> {
        self.state().extensions.get(id).cloned()
    }

    /// 开始挂载路由，每个运行时只允许一次
    pub fn begin_mount(&self) -> Result<(), ExtensionError> {
        if self.routes_mounted.swap(true, Ordering::SeqCst) {
            return Err(ExtensionError::RoutesAlreadyMounted);
        }
        Ok(())
    }

    pub fn routes_mounted(&self) -> bool {
        self.routes_mounted.load(Ordering::SeqCst)
    }

    /// 记录已挂载的键，已存在时返回 false
    pub fn mark_mounted(&self, key: String) -> bool {
        self.mounted.lock().unwrap_or_else(PoisonError::into_inner).insert(key)
    }

    /// 安装扩展：注册、调用安装回调并写入默认配置
    pub async fn install(&self, kind: ExtensionKind, name: &str) -> Result<ExtensionRecord, ExtensionError> {
        let id = ExtensionId::new(kind, name);
        if self.registry.get(kind, name).await?.is_some() {
            return Err(ExtensionError::AlreadyExists(id.to_string()));
        }

        let dir = match kind {
            ExtensionKind::Plugin => self.plugins_dir.join(name),
            ExtensionKind::Theme => self.themes_dir.join(name),
        };
        if !dir.is_dir() {
            return Err(ExtensionError::NotFound(format!("{} ({})", id, dir.display())));
        }
        let record = self.registry.register(kind, name, &dir).await?.ok_or_else(|| {
            ExtensionError::ManifestError {
                path: dir.join(kind.manifest_file()).display().to_string(),
                message: "清单缺失或格式错误".to_string(),
            }
        })?;

        let instance = self.loader().instantiate(&record)?;
        if let Some(instance) = instance {
            run_lifecycle(&id, "on_install", || instance.on_install())?;
            if record.config_data.as_object().map_or(true, |o| o.is_empty()) {
                if let Some(config) = guarded(&id, "default_config", || instance.default_config()) {
                    self.registry.set_config(kind, name, &config).await?;
                }
            }
        }

        info!("{} 安装成功", id);
        self.registry.get(kind, name).await?.ok_or(ExtensionError::NotFound(id.to_string()))
    }

    /// 激活扩展并同步当前进程
    pub async fn activate(&self, kind: ExtensionKind, name: &str) -> Result<(), ExtensionError> {
        let id = ExtensionId::new(kind, name);
        let record = self.require(kind, name).await?;
        if !record.is_compatible(&self.app_version)? {
            return Err(ExtensionError::Incompatible {
                name: id.to_string(),
                app_version: self.app_version.clone(),
            });
        }

        self.registry.activate(kind, name).await?;
        self.reconcile().await;

        if let Some(instance) = self.get_loaded(&id).and_then(|e| e.instance) {
            if let Err(e) = run_lifecycle(&id, "on_activate", || instance.on_activate()) {
                warn!("{}", e);
            }
        }
        Ok(())
    }

    pub async fn deactivate(&self, kind: ExtensionKind, name: &str) -> Result<(), ExtensionError> {
        let id = ExtensionId::new(kind, name);
        self.require(kind, name).await?;

        if let Some(instance) = self.get_loaded(&id).and_then(|e| e.instance) {
            if let Err(e) = run_lifecycle(&id, "on_deactivate", || instance.on_deactivate()) {
                warn!("{}", e);
            }
        }

        self.registry.deactivate(kind, name).await?;
        self.reconcile().await;
        Ok(())
    }

    /// 卸载扩展：调用卸载回调并停用，注册表记录保留
    pub async fn uninstall(&self, kind: ExtensionKind, name: &str) -> Result<(), ExtensionError> {
        let id = ExtensionId::new(kind, name);
        let record = self.require(kind, name).await?;
        if record.is_system {
            return Err(ExtensionError::SystemExtension(id.to_string()));
        }

        let instance: Option<Arc<dyn Extension>> = match self.get_loaded(&id).and_then(|e| e.instance) {
            Some(instance) => Some(instance),
            None => self.loader().instantiate(&record)?.map(Arc::from),
        };
        if let Some(instance) = instance {
            run_lifecycle(&id, "on_uninstall", || instance.on_uninstall())?;
        }

        self.registry.deactivate(kind, name).await?;
        self.reconcile().await;
        info!("{} 已卸载", id);
        Ok(())
    }

    pub async fn get_config(&self, kind: ExtensionKind, name: &str) -> Result<Value, ExtensionError> {
        self.registry.get_config(kind, name).await
    }

    /// 写入配置并重载当前进程，其他进程在扩展集合变化时才会看到新配置
    pub async fn set_config(&self, kind: ExtensionKind, name: &str, config: &Value) -> Result<(), ExtensionError> {
        if !self.registry.set_config(kind, name, config).await? {
            return Err(ExtensionError::NotFound(ExtensionId::new(kind, name).to_string()));
        }
        self.reload().await?;
        Ok(())
    }

    async fn require(&self, kind: ExtensionKind, name: &str) -> Result<ExtensionRecord, ExtensionError> {
        self.registry
            .get(kind, name)
            .await?
            .ok_or_else(|| ExtensionError::NotFound(ExtensionId::new(kind, name).to_string()))
    }

    fn loader(&self) -> MutexGuard<'_, ModuleLoader> {
        self.loader.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 以 `扩展:分组` 作为路由挂载的去重键
pub fn mount_key(id: &ExtensionId, group: &str) -> String {
    format!("{}:{}", id.namespace(), group)
}

/// 调用扩展方法，panic 时记录日志并返回默认值
pub(crate) fn guarded<T: Default>(id: &ExtensionId, what: &str, f: impl FnOnce() -> T) -> T {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(payload) => {
            error!("扩展 {} 的 {} 发生严重错误: {}", id, what, panic_message(payload.as_ref()));
            T::default()
        }
    }
}

fn run_lifecycle(id: &ExtensionId, what: &str, f: impl FnOnce() -> anyhow::Result<()>) -> Result<(), ExtensionError> {
    let message = match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(e)) => format!("{:#}", e),
        Err(payload) => panic_message(payload.as_ref()),
    };
    Err(ExtensionError::HookError {
        owner: id.namespace(),
        hook_name: what.to_string(),
        message,
    })
}

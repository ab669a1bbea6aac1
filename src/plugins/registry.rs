//! 持久化的扩展注册表。
//!
//! 注册表是多个工作进程之间唯一共享的状态，所有写入都是普通事务，后写覆盖先写。

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::error::ExtensionError;
use crate::models::{ExtensionId, ExtensionKind, ExtensionRecord, HookKind, HookRecord, Manifest};
use crate::utils::{to_absolute, to_project_relative};

const SELECT_COLUMNS: &str = "id, kind, name, display_name, description, version, author, \
    author_website, license, min_version, max_version, is_active, is_system, install_path, entry, \
    screenshot, demo_url, config_schema, config_data, installed_at, updated_at, activated_at";

#[derive(Debug, FromRow)]
struct ExtensionRow {
    id: i64,
    kind: String,
    name: String,
    display_name: String,
    description: Option<String>,
    version: String,
    author: Option<String>,
    author_website: Option<String>,
    license: Option<String>,
    min_version: Option<String>,
    max_version: Option<String>,
    is_active: bool,
    is_system: bool,
    install_path: String,
    entry: Option<String>,
    screenshot: Option<String>,
    demo_url: Option<String>,
    config_schema: Option<String>,
    config_data: Option<String>,
    installed_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    activated_at: Option<DateTime<Utc>>,
}

impl ExtensionRow {
    fn into_record(self, base_dir: &Path) -> Result<ExtensionRecord, ExtensionError> {
        let kind = ExtensionKind::from_str(&self.kind)
            .map_err(|e| ExtensionError::Storage(sqlx::Error::Decode(e.into())))?;

        // 配置无法解析时按空配置处理
        let config_data = self
            .config_data
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_else(|| Value::Object(Default::default()));
        let config_schema = self
            .config_schema
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or(Value::Null);

        Ok(ExtensionRecord {
            id: self.id,
            kind,
            install_path: to_absolute(base_dir, &self.install_path),
            name: self.name,
            display_name: self.display_name,
            description: self.description,
            version: self.version,
            author: self.author,
            author_website: self.author_website,
            license: self.license,
            min_version: self.min_version,
            max_version: self.max_version,
            is_active: self.is_active,
            is_system: self.is_system,
            entry: self.entry,
            screenshot: self.screenshot,
            demo_url: self.demo_url,
            config_schema,
            config_data,
            installed_at: self.installed_at,
            updated_at: self.updated_at,
            activated_at: self.activated_at,
        })
    }
}

/// 扩展注册表
#[derive(Clone)]
pub struct ExtensionRegistry {
    pool: SqlitePool,
    /// 项目根目录，安装路径相对它存储
    base_dir: PathBuf,
}

impl ExtensionRegistry {
    /// 连接数据库，内存数据库只使用一个长期连接
    pub async fn connect(database_url: &str, base_dir: &Path) -> Result<Self, ExtensionError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");

        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?
        };

        info!("已连接扩展注册表: {}", database_url);
        Ok(Self::with_pool(pool, base_dir))
    }

    pub fn with_pool(pool: SqlitePool, base_dir: &Path) -> Self {
        let base_dir = base_dir.canonicalize().unwrap_or_else(|_| base_dir.to_path_buf());
        Self { pool, base_dir }
    }

    /// 执行数据库迁移
    pub async fn migrate(&self) -> Result<(), ExtensionError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// 扫描目录，把未注册的扩展写入注册表（不激活），返回新注册的名称
    pub async fn discover(&self, kind: ExtensionKind, dir: &Path) -> Result<Vec<String>, ExtensionError> {
        if !dir.exists() {
            info!("{}目录不存在，创建目录: {}", kind_label(kind), dir.display());
            std::fs::create_dir_all(dir)?;
            return Ok(Vec::new());
        }

        let mut discovered = Vec::new();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1).follow_links(true).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("读取目录条目失败: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_dir() || !entry.path().join(kind.manifest_file()).is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().to_string();
            if self.get(kind, &name).await?.is_some() {
                continue;
            }
            if self.register(kind, &name, entry.path()).await?.is_some() {
                discovered.push(name);
            }
        }

        if !discovered.is_empty() {
            info!("发现 {} 个新{}: {:?}", discovered.len(), kind_label(kind), discovered);
        }
        Ok(discovered)
    }

    /// 读取清单并注册；清单缺失或格式错误时记录日志并返回 `None`
    pub async fn register(&self, kind: ExtensionKind, name: &str, path: &Path) -> Result<Option<ExtensionRecord>, ExtensionError> {
        if let Some(existing) = self.get(kind, name).await? {
            return Ok(Some(existing));
        }

        let manifest = match Manifest::load(kind, path) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("注册{} {} 失败: {}", kind_label(kind), name, e);
                return Ok(None);
            }
        };

        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let stored_path = to_project_relative(&self.base_dir, &path).to_string_lossy().into_owned();
        let config_schema = manifest.config_schema.as_ref().map(serde_json::to_string).transpose()?;
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO extensions (kind, name, display_name, description, version, author,
                author_website, license, min_version, max_version, is_active, is_system,
                install_path, entry, screenshot, demo_url, config_schema, installed_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (kind, name) DO NOTHING
            "#,
        )
        .bind(kind.as_str())
        .bind(name)
        .bind(manifest.display_name.as_deref().unwrap_or(name))
        .bind(manifest.description.as_deref())
        .bind(manifest.version.as_deref().unwrap_or("1.0.0"))
        .bind(manifest.author.as_deref())
        .bind(manifest.author_website.as_deref())
        .bind(manifest.license.as_deref())
        .bind(manifest.min_noteblog_version.as_deref())
        .bind(manifest.max_noteblog_version.as_deref())
        .bind(manifest.is_system)
        .bind(stored_path)
        .bind(manifest.entry.as_deref())
        .bind(manifest.screenshot.as_deref())
        .bind(manifest.demo_url.as_deref())
        .bind(config_schema)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        info!("{} {} 已注册到数据库", kind_label(kind), name);
        self.get(kind, name).await
    }

    pub async fn get(&self, kind: ExtensionKind, name: &str) -> Result<Option<ExtensionRecord>, ExtensionError> {
        let sql = format!("SELECT {} FROM extensions WHERE kind = ? AND name = ?", SELECT_COLUMNS);
        let row = sqlx::query_as::<_, ExtensionRow>(&sql)
            .bind(kind.as_str())
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.into_record(&self.base_dir)).transpose()
    }

    pub async fn list(&self, kind: ExtensionKind) -> Result<Vec<ExtensionRecord>, ExtensionError> {
        let sql = format!("SELECT {} FROM extensions WHERE kind = ? ORDER BY name", SELECT_COLUMNS);
        let rows = sqlx::query_as::<_, ExtensionRow>(&sql)
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(|r| r.into_record(&self.base_dir)).collect()
    }

    /// 所有激活的扩展，插件在前，主题在后
    pub async fn list_active(&self) -> Result<Vec<ExtensionRecord>, ExtensionError> {
        let sql = format!(
            "SELECT {} FROM extensions WHERE is_active = 1 ORDER BY kind, name",
            SELECT_COLUMNS
        );
        let rows = sqlx::query_as::<_, ExtensionRow>(&sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(|r| r.into_record(&self.base_dir)).collect()
    }

    /// 激活集合，用于对账，只查一次
    pub async fn active_ids(&self) -> Result<BTreeSet<ExtensionId>, ExtensionError> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT kind, name FROM extensions WHERE is_active = 1",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut ids = BTreeSet::new();
        for (kind, name) in rows {
            match ExtensionKind::from_str(&kind) {
                Ok(kind) => {
                    ids.insert(ExtensionId::new(kind, name));
                }
                Err(e) => warn!("忽略注册表中的记录 {}: {}", name, e),
            }
        }
        Ok(ids)
    }

    /// 激活扩展；主题在同一事务中先停用其他主题
    pub async fn activate(&self, kind: ExtensionKind, name: &str) -> Result<bool, ExtensionError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        if kind == ExtensionKind::Theme {
            sqlx::query(
                "UPDATE extensions SET is_active = 0, activated_at = NULL, updated_at = ? \
                 WHERE kind = 'theme' AND is_active = 1 AND name != ?",
            )
            .bind(now)
            .bind(name)
            .execute(&mut *tx)
            .await?;
        }

        let result = sqlx::query(
            "UPDATE extensions SET is_active = 1, activated_at = ?, updated_at = ? WHERE kind = ? AND name = ?",
        )
        .bind(now)
        .bind(now)
        .bind(kind.as_str())
        .bind(name)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        tx.commit().await?;
        info!("{} {} 已激活", kind_label(kind), name);
        Ok(true)
    }

    pub async fn deactivate(&self, kind: ExtensionKind, name: &str) -> Result<bool, ExtensionError> {
        let result = sqlx::query(
            "UPDATE extensions SET is_active = 0, updated_at = ? WHERE kind = ? AND name = ?",
        )
        .bind(Utc::now())
        .bind(kind.as_str())
        .bind(name)
        .execute(&self.pool)
        .await?;

        let changed = result.rows_affected() > 0;
        if changed {
            info!("{} {} 已停用", kind_label(kind), name);
        }
        Ok(changed)
    }

    pub async fn get_config(&self, kind: ExtensionKind, name: &str) -> Result<Value, ExtensionError> {
        self.get(kind, name)
            .await?
            .map(|record| record.config_data)
            .ok_or_else(|| ExtensionError::NotFound(ExtensionId::new(kind, name).to_string()))
    }

    pub async fn set_config(&self, kind: ExtensionKind, name: &str, config: &Value) -> Result<bool, ExtensionError> {
        let data = serde_json::to_string_pretty(config)?;
        let result = sqlx::query(
            "UPDATE extensions SET config_data = ?, updated_at = ? WHERE kind = ? AND name = ?",
        )
        .bind(data)
        .bind(Utc::now())
        .bind(kind.as_str())
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// 写入钩子审计记录，替换该扩展之前的记录
    pub async fn record_hooks(&self, extension_id: i64, hooks: &[HookRecord]) -> Result<(), ExtensionError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM extension_hooks WHERE extension_id = ?")
            .bind(extension_id)
            .execute(&mut *tx)
            .await?;

        for hook in hooks {
            sqlx::query(
                "INSERT INTO extension_hooks (extension_id, hook_name, hook_type, priority, accepted_args, recorded_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(extension_id)
            .bind(&hook.hook_name)
            .bind(hook.hook_type.as_str())
            .bind(hook.priority)
            .bind(hook.accepted_args as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!("记录扩展 {} 的 {} 个钩子", extension_id, hooks.len());
        Ok(())
    }

    pub async fn hook_records(&self, extension_id: i64) -> Result<Vec<HookRecord>, ExtensionError> {
        let rows = sqlx::query_as::<_, (String, String, i32, i64)>(
            "SELECT hook_name, hook_type, priority, accepted_args FROM extension_hooks \
             WHERE extension_id = ? ORDER BY hook_name, priority, id",
        )
        .bind(extension_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(hook_name, hook_type, priority, accepted_args)| {
                let hook_type = match hook_type.as_str() {
                    "action" => HookKind::Action,
                    "filter" => HookKind::Filter,
                    "template" => HookKind::Template,
                    _ => return None,
                };
                Some(HookRecord {
                    hook_name,
                    hook_type,
                    priority,
                    accepted_args: accepted_args.max(0) as usize,
                })
            })
            .collect())
    }
}

fn kind_label(kind: ExtensionKind) -> &'static str {
    match kind {
        ExtensionKind::Plugin => "插件",
        ExtensionKind::Theme => "主题",
    }
}

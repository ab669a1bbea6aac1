use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};

/// 配置文件名
pub const CONFIG_FILE: &str = "noteblog.yml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub site_title: String,
    pub site_description: String,
    pub database_url: String,
    pub plugins_dir: String,
    pub themes_dir: String,
    pub default_theme: String,
    /// 用于兼容性检查的应用版本
    pub app_version: String,
    pub host: String,
    pub port: u16,
    pub recent_posts_limit: i64,
    /// 跳过扩展发现与加载（首次初始化数据库时使用）
    pub skip_extension_init: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_title: "Noteblog".to_string(),
            site_description: String::new(),
            database_url: "sqlite://noteblog.db?mode=rwc".to_string(),
            plugins_dir: "plugins".to_string(),
            themes_dir: "themes".to_string(),
            default_theme: "default".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            host: "0.0.0.0".to_string(),
            port: 5000,
            recent_posts_limit: 5,
            skip_extension_init: false,
        }
    }
}

impl Config {
    /// 从文件加载配置
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
        Ok(config)
    }

    /// 加载站点目录下的配置，不存在时使用默认值，再应用环境变量覆盖
    pub fn load(base_dir: &Path) -> Result<Self> {
        let path = base_dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            Config::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// 环境变量覆盖
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.is_empty() {
                self.database_url = url;
            }
        }
        if let Some(port) = std::env::var("NOTEBLOG_PORT").ok().and_then(|p| p.parse().ok()) {
            self.port = port;
        }
        if std::env::var("SKIP_PLUGIN_INIT").map(|v| v == "1").unwrap_or(false) {
            self.skip_extension_init = true;
        }
    }

    /// 保存配置到文件
    pub fn save(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;
        Ok(())
    }

    pub fn plugins_path(&self, base_dir: &Path) -> PathBuf {
        base_dir.join(&self.plugins_dir)
    }

    pub fn themes_path(&self, base_dir: &Path) -> PathBuf {
        base_dir.join(&self.themes_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: Config = serde_yaml::from_str("site_title: 我的博客\nport: 8080\n").unwrap();
        assert_eq!(config.site_title, "我的博客");
        assert_eq!(config.port, 8080);
        assert_eq!(config.default_theme, "default");
        assert_eq!(config.recent_posts_limit, 5);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.site_title = "Saved".to_string();
        config.save(&dir.path().join(CONFIG_FILE)).unwrap();

        let loaded = Config::from_file(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(loaded.site_title, "Saved");
    }
}

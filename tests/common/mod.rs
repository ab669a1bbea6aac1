// 集成测试共用的站点夹具
#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use noteblog::models::Config;
use noteblog::plugins::{ExtensionRegistry, ExtensionRuntime};
use serde_json::{json, Value};
use tempfile::TempDir;

pub struct Site {
    pub dir: TempDir,
    pub config: Config,
}

impl Site {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_plugin(&self, name: &str, manifest: Value) {
        let dir = self.path().join("plugins").join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("plugin.json"), manifest.to_string()).unwrap();
    }

    pub fn write_theme(&self, name: &str, manifest: Value, templates: &[(&str, &str)]) {
        let dir = self.path().join("themes").join(name);
        fs::create_dir_all(dir.join("templates")).unwrap();
        fs::write(dir.join("theme.json"), manifest.to_string()).unwrap();
        for (file, content) in templates {
            let path = dir.join("templates").join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
    }

    pub async fn registry(&self) -> ExtensionRegistry {
        let registry = ExtensionRegistry::connect(&self.config.database_url, self.path()).await.unwrap();
        registry.migrate().await.unwrap();
        registry
    }

    pub async fn runtime(&self) -> Arc<ExtensionRuntime> {
        Arc::new(ExtensionRuntime::new(self.registry().await, &self.config))
    }
}

/// 带默认主题的临时站点，使用内存数据库
pub fn site() -> Site {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("plugins")).unwrap();

    let config = Config {
        database_url: "sqlite::memory:".to_string(),
        app_version: "1.2.0".to_string(),
        ..Config::default()
    };

    let site = Site { dir, config };
    site.write_theme(
        "default",
        json!({"display_name": "默认主题", "is_system": true}),
        &[
            ("base.html", "<html>{% block content %}{% endblock %}</html>"),
            ("index.html", "{% extends \"base.html\" %}{% block content %}default-index{% endblock %}"),
            ("404.html", "not-found:{{ path | default(value=\"\") | safe }}"),
            ("page.html", "{{ page_title | default(value=\"\") }}-{{ id | default(value=\"\") }}"),
        ],
    );
    site
}

pub fn manifest(version: &str) -> Value {
    json!({"display_name": "测试扩展", "version": version})
}

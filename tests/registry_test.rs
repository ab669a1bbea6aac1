mod common;

use noteblog::models::{ExtensionKind, HookKind, HookRecord};
use noteblog::plugins::ExtensionError;
use serde_json::json;

#[tokio::test]
async fn test_discover_is_idempotent_and_never_activates() {
    let site = common::site();
    site.write_plugin("alpha", common::manifest("1.0.0"));
    // 没有清单的目录和清单格式错误的目录都不可见
    std::fs::create_dir_all(site.path().join("plugins/no_manifest")).unwrap();
    std::fs::create_dir_all(site.path().join("plugins/broken")).unwrap();
    std::fs::write(site.path().join("plugins/broken/plugin.json"), "{ not json").unwrap();

    let registry = site.registry().await;
    let plugins_dir = site.path().join("plugins");

    let found = registry.discover(ExtensionKind::Plugin, &plugins_dir).await.unwrap();
    assert_eq!(found, vec!["alpha".to_string()]);

    let again = registry.discover(ExtensionKind::Plugin, &plugins_dir).await.unwrap();
    assert!(again.is_empty());

    let plugins = registry.list(ExtensionKind::Plugin).await.unwrap();
    assert_eq!(plugins.len(), 1);
    assert!(!plugins[0].is_active);
    assert_eq!(plugins[0].display_name, "测试扩展");
    assert!(registry.active_ids().await.unwrap().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn test_discover_follows_symlinked_directories() {
    let site = common::site();
    let shared = tempfile::tempdir().unwrap();
    let target = shared.path().join("linked");
    std::fs::create_dir_all(&target).unwrap();
    std::fs::write(target.join("plugin.json"), common::manifest("1.0.0").to_string()).unwrap();
    std::os::unix::fs::symlink(&target, site.path().join("plugins/linked")).unwrap();

    let registry = site.registry().await;
    let found = registry.discover(ExtensionKind::Plugin, &site.path().join("plugins")).await.unwrap();
    assert_eq!(found, vec!["linked".to_string()]);
}

#[tokio::test]
async fn test_discover_creates_missing_directory() {
    let site = common::site();
    let registry = site.registry().await;
    let dir = site.path().join("extra_plugins");

    let found = registry.discover(ExtensionKind::Plugin, &dir).await.unwrap();
    assert!(found.is_empty());
    assert!(dir.is_dir());
}

#[tokio::test]
async fn test_register_returns_existing_row_and_stores_relative_path() {
    let site = common::site();
    site.write_plugin("alpha", common::manifest("1.0.0"));
    let registry = site.registry().await;
    let path = site.path().join("plugins/alpha");

    let first = registry.register(ExtensionKind::Plugin, "alpha", &path).await.unwrap().unwrap();
    site.write_plugin("alpha", common::manifest("2.0.0"));
    let second = registry.register(ExtensionKind::Plugin, "alpha", &path).await.unwrap().unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(second.version, "1.0.0");
    assert!(second.install_path.is_absolute());
    assert!(second.install_path.ends_with("plugins/alpha"));

    let stored: String = sqlx::query_scalar("SELECT install_path FROM extensions WHERE name = 'alpha'")
        .fetch_one(registry.pool())
        .await
        .unwrap();
    assert_eq!(std::path::Path::new(&stored), std::path::Path::new("plugins/alpha"));

    let missing = registry
        .register(ExtensionKind::Plugin, "ghost", &site.path().join("plugins/ghost"))
        .await
        .unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn test_theme_activation_keeps_single_active_theme() {
    let site = common::site();
    site.write_theme("night", common::manifest("1.0.0"), &[]);
    let registry = site.registry().await;
    registry.discover(ExtensionKind::Theme, &site.path().join("themes")).await.unwrap();

    assert!(registry.activate(ExtensionKind::Theme, "default").await.unwrap());
    assert!(registry.activate(ExtensionKind::Theme, "night").await.unwrap());

    let active: Vec<String> = registry
        .list(ExtensionKind::Theme)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.is_active)
        .map(|t| t.name)
        .collect();
    assert_eq!(active, vec!["night".to_string()]);

    // 插件和主题同名互不影响
    assert!(!registry.activate(ExtensionKind::Plugin, "night").await.unwrap());
    assert!(!registry.activate(ExtensionKind::Theme, "ghost").await.unwrap());
}

#[tokio::test]
async fn test_config_round_trip_and_unparsable_blob() {
    let site = common::site();
    site.write_plugin("alpha", common::manifest("1.0.0"));
    let registry = site.registry().await;
    registry.discover(ExtensionKind::Plugin, &site.path().join("plugins")).await.unwrap();

    assert_eq!(registry.get_config(ExtensionKind::Plugin, "alpha").await.unwrap(), json!({}));

    let config = json!({"message": "你好", "limit": 3});
    assert!(registry.set_config(ExtensionKind::Plugin, "alpha", &config).await.unwrap());
    assert_eq!(registry.get_config(ExtensionKind::Plugin, "alpha").await.unwrap(), config);

    sqlx::query("UPDATE extensions SET config_data = 'not json' WHERE name = 'alpha'")
        .execute(registry.pool())
        .await
        .unwrap();
    assert_eq!(registry.get_config(ExtensionKind::Plugin, "alpha").await.unwrap(), json!({}));

    let missing = registry.get_config(ExtensionKind::Plugin, "ghost").await;
    assert!(matches!(missing, Err(ExtensionError::NotFound(_))));
}

#[tokio::test]
async fn test_activation_checks_compatibility() {
    let site = common::site();
    site.write_plugin("future", json!({"version": "1.0.0", "min_noteblog_version": "9.0"}));
    site.write_plugin("legacy", json!({"version": "1.0.0", "max_noteblog_version": "1.1.9"}));
    site.write_plugin("odd", json!({"version": "1.0.0", "min_noteblog_version": "1.x"}));
    site.write_plugin("fits", json!({"version": "1.0.0", "min_noteblog_version": "1.2", "max_noteblog_version": "1.2.0"}));

    let runtime = site.runtime().await;
    runtime.discover_all().await.unwrap();

    let future = runtime.activate(ExtensionKind::Plugin, "future").await;
    assert!(matches!(future, Err(ExtensionError::Incompatible { .. })));
    let legacy = runtime.activate(ExtensionKind::Plugin, "legacy").await;
    assert!(matches!(legacy, Err(ExtensionError::Incompatible { .. })));
    let odd = runtime.activate(ExtensionKind::Plugin, "odd").await;
    assert!(matches!(odd, Err(ExtensionError::InvalidVersion { .. })));

    // 没有入口的插件可以激活，只是不会被加载
    runtime.activate(ExtensionKind::Plugin, "fits").await.unwrap();
    let active = runtime.registry().active_ids().await.unwrap();
    assert_eq!(active.len(), 1);
}

#[tokio::test]
async fn test_hook_audit_rows_are_replaced() {
    let site = common::site();
    site.write_plugin("alpha", common::manifest("1.0.0"));
    let registry = site.registry().await;
    let record = registry
        .register(ExtensionKind::Plugin, "alpha", &site.path().join("plugins/alpha"))
        .await
        .unwrap()
        .unwrap();

    let hook = |name: &str| HookRecord {
        hook_name: name.to_string(),
        hook_type: HookKind::Filter,
        priority: 10,
        accepted_args: 1,
    };
    registry.record_hooks(record.id, &[hook("a"), hook("b")]).await.unwrap();
    registry.record_hooks(record.id, &[hook("c")]).await.unwrap();

    let rows = registry.hook_records(record.id).await.unwrap();
    assert_eq!(rows, vec![hook("c")]);
}

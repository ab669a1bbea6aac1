use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use serde_json::{json, Value};
use tracing::info;

use crate::core::{AppState, Server};
use crate::models::{Config, ExtensionKind, ExtensionRecord};
use crate::plugins::{register_builtin_extensions, ExtensionRegistry, ExtensionRuntime};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// 指定站点目录
    #[arg(short, long, default_value = ".")]
    pub path: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 启动服务器
    Serve(ServeArgs),

    /// 扫描插件和主题目录并注册新扩展
    Discover,

    /// 插件管理
    Plugin(PluginArgs),

    /// 主题管理
    Theme(ThemeArgs),
}

#[derive(Args)]
pub struct ServeArgs {
    /// 服务器端口，覆盖配置文件
    #[arg(short, long)]
    pub port: Option<u16>,
}

#[derive(Args)]
pub struct PluginArgs {
    #[command(subcommand)]
    command: PluginCommands,
}

#[derive(Subcommand)]
pub enum PluginCommands {
    /// 列出已注册的插件
    List,
    /// 安装插件
    Install { name: String },
    /// 激活插件
    Activate { name: String },
    /// 停用插件
    Deactivate { name: String },
    /// 卸载插件
    Uninstall { name: String },
    /// 查看或修改插件配置
    Config(ConfigArgs),
    /// 查看插件最近一次加载时注册的钩子
    Hooks { name: String },
}

#[derive(Args)]
pub struct ThemeArgs {
    #[command(subcommand)]
    command: ThemeCommands,
}

#[derive(Subcommand)]
pub enum ThemeCommands {
    /// 列出已注册的主题
    List,
    /// 激活主题
    Activate { name: String },
    /// 查看或修改主题配置
    Config(ConfigArgs),
    /// 创建新主题
    Create {
        name: String,
        /// 显示名称
        #[arg(short, long)]
        display_name: Option<String>,
    },
}

#[derive(Args)]
pub struct ConfigArgs {
    pub name: String,

    /// 以 JSON 写入新配置
    #[arg(long)]
    pub set: Option<String>,
}

// 新主题的基础模板
const BASE_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="zh-CN">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>{% block title %}{{ site_title | default(value="Noteblog") }}{% endblock %}</title>
    {% block head %}{% endblock %}
</head>
<body>
    {% block header %}{% endblock %}

    <main>
        {% block content %}{% endblock %}
    </main>

    {% block footer %}{% endblock %}

    {% block scripts %}{% endblock %}
</body>
</html>
"#;

/// 打开注册表并创建运行时（不加载扩展）
async fn open_runtime(base_dir: &Path, config: &Config) -> Result<ExtensionRuntime> {
    let registry = ExtensionRegistry::connect(&config.database_url, base_dir).await?;
    registry.migrate().await?;
    let runtime = ExtensionRuntime::new(registry, config);
    register_builtin_extensions(&runtime);
    Ok(runtime)
}

fn print_records(title: &str, records: &[ExtensionRecord]) {
    println!("{}", title.bright_cyan());
    if records.is_empty() {
        println!("  (无)");
        return;
    }
    for record in records {
        let status = if record.is_active {
            "已激活".green()
        } else {
            "未激活".dimmed()
        };
        let system = if record.is_system { " [系统]".yellow().to_string() } else { String::new() };
        let configurable = if record.has_config() { " [可配置]".cyan().to_string() } else { String::new() };
        println!(
            "  - {} v{} [{}]{}{} {}",
            record.name.bright_white(),
            record.version,
            status,
            system,
            configurable,
            record.display_name
        );
    }
}

async fn handle_config(runtime: &ExtensionRuntime, kind: ExtensionKind, args: ConfigArgs) -> Result<()> {
    match args.set {
        Some(raw) => {
            let value: Value = serde_json::from_str(&raw).context("配置必须是合法的 JSON")?;
            runtime.set_config(kind, &args.name, &value).await?;
            println!("{} 的配置已更新", args.name.bright_white());
        }
        None => {
            let value = runtime.get_config(kind, &args.name).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
    }
    Ok(())
}

/// 创建主题目录结构并写入清单和基础模板
fn scaffold_theme(theme_path: &Path, name: &str, display_name: &str) -> Result<()> {
    if theme_path.exists() {
        return Err(anyhow!("主题已存在: {}", theme_path.display()));
    }

    for dir in ["templates", "static/css", "static/js", "static/images"] {
        fs::create_dir_all(theme_path.join(dir))?;
    }

    let manifest = json!({
        "display_name": display_name,
        "description": format!("{} 主题", display_name),
        "version": "1.0.0",
        "author": "",
        "config_schema": {},
    });
    fs::write(theme_path.join("theme.json"), serde_json::to_string_pretty(&manifest)?)?;
    fs::write(theme_path.join("templates").join("base.html"), BASE_TEMPLATE)?;

    info!("主题 {} 已创建: {}", name, theme_path.display());
    Ok(())
}

pub async fn execute(cli: Cli) -> Result<()> {
    let base_dir = cli.path;
    let mut config = Config::load(&base_dir)?;

    match cli.command {
        Commands::Serve(args) => {
            if let Some(port) = args.port {
                config.port = port;
            }
            let state = AppState::bootstrap(&base_dir, config).await?;
            Server::new(state).start().await?;
        }
        Commands::Discover => {
            let runtime = open_runtime(&base_dir, &config).await?;
            let found = runtime.discover_all().await?;
            runtime.ensure_default_theme().await?;
            if found.is_empty() {
                println!("没有发现新的扩展");
            } else {
                println!("发现 {} 个新扩展:", found.len());
                for id in found {
                    println!("  - {}", id.to_string().bright_white());
                }
            }
        }
        Commands::Plugin(args) => {
            let runtime = open_runtime(&base_dir, &config).await?;
            let kind = ExtensionKind::Plugin;
            match args.command {
                PluginCommands::List => {
                    print_records("插件列表:", &runtime.registry().list(kind).await?);
                }
                PluginCommands::Install { name } => {
                    let record = runtime.install(kind, &name).await?;
                    println!("插件 {} v{} 安装成功", record.name.bright_white(), record.version);
                }
                PluginCommands::Activate { name } => {
                    runtime.activate(kind, &name).await?;
                    println!("插件 {} 已激活", name.bright_white());
                }
                PluginCommands::Deactivate { name } => {
                    runtime.deactivate(kind, &name).await?;
                    println!("插件 {} 已停用", name.bright_white());
                }
                PluginCommands::Uninstall { name } => {
                    runtime.uninstall(kind, &name).await?;
                    println!("插件 {} 已卸载", name.bright_white());
                }
                PluginCommands::Config(args) => handle_config(&runtime, kind, args).await?,
                PluginCommands::Hooks { name } => {
                    let record = runtime
                        .registry()
                        .get(kind, &name)
                        .await?
                        .ok_or_else(|| anyhow!("插件不存在: {}", name))?;
                    let hooks = runtime.registry().hook_records(record.id).await?;
                    println!("插件 {} 的钩子:", name.bright_white());
                    for hook in hooks {
                        println!(
                            "  - {} ({}, 优先级 {}, 参数 {})",
                            hook.hook_name, hook.hook_type.as_str(), hook.priority, hook.accepted_args
                        );
                    }
                }
            }
        }
        Commands::Theme(args) => {
            let runtime = open_runtime(&base_dir, &config).await?;
            let kind = ExtensionKind::Theme;
            match args.command {
                ThemeCommands::List => {
                    print_records("主题列表:", &runtime.registry().list(kind).await?);
                }
                ThemeCommands::Activate { name } => {
                    runtime.activate(kind, &name).await?;
                    println!("主题 {} 已激活", name.bright_white());
                }
                ThemeCommands::Config(args) => handle_config(&runtime, kind, args).await?,
                ThemeCommands::Create { name, display_name } => {
                    if !crate::utils::is_safe_segment(&name) {
                        return Err(anyhow!("主题名称不合法: {}", name));
                    }
                    let theme_path = runtime.themes_dir().join(&name);
                    scaffold_theme(&theme_path, &name, display_name.as_deref().unwrap_or(&name))?;
                    runtime
                        .registry()
                        .register(kind, &name, &theme_path)
                        .await?
                        .ok_or_else(|| anyhow!("主题 {} 注册失败", name))?;
                    println!("主题 {} 创建成功", name.bright_white());
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaffold_theme_layout() {
        let dir = tempfile::tempdir().unwrap();
        let theme_path = dir.path().join("night");
        scaffold_theme(&theme_path, "night", "夜色").unwrap();

        assert!(theme_path.join("static/css").is_dir());
        assert!(theme_path.join("static/images").is_dir());
        assert!(theme_path.join("templates/base.html").is_file());

        let manifest = crate::models::Manifest::load(ExtensionKind::Theme, &theme_path).unwrap();
        assert_eq!(manifest.display_name.as_deref(), Some("夜色"));

        assert!(scaffold_theme(&theme_path, "night", "夜色").is_err());
    }

    #[test]
    fn test_cli_parses_nested_commands() {
        let cli = Cli::try_parse_from(["noteblog", "-p", "site", "plugin", "config", "hello_world", "--set", "{}"]).unwrap();
        assert_eq!(cli.path, PathBuf::from("site"));
        assert!(matches!(
            cli.command,
            Commands::Plugin(PluginArgs { command: PluginCommands::Config(ConfigArgs { ref set, .. }) }) if set.as_deref() == Some("{}")
        ));
    }
}

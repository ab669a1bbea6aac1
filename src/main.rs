use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use tracing::error;
use tracing_subscriber::fmt;

use noteblog::cli;

#[tokio::main]
async fn main() -> Result<()> {
    // 读取 .env
    dotenvy::dotenv().ok();

    // 初始化日志系统
    fmt()
        .with_target(false)
        .init();

    // 解析命令行参数
    let cli = cli::Cli::parse();

    // 打印欢迎信息
    println!("{}", "
 _   _       _       _     _
| \\ | | ___ | |_ ___| |__ | | ___   __ _
|  \\| |/ _ \\| __/ _ \\ '_ \\| |/ _ \\ / _` |
| |\\  | (_) | ||  __/ |_) | | (_) | (_| |
|_| \\_|\\___/ \\__\\___|_.__/|_|\\___/ \\__, |
                                   |___/
    ".bright_cyan());

    println!("{} {}", "Noteblog".bright_cyan(), env!("CARGO_PKG_VERSION").bright_green());
    println!("{}", "A blog engine with runtime plugins and themes".bright_white());
    println!();

    // 执行命令
    if let Err(e) = cli::execute(cli).await {
        error!("Error: {}", e);

        // 打印错误链
        let mut source = e.source();
        while let Some(e) = source {
            error!("Caused by: {}", e);
            source = e.source();
        }

        std::process::exit(1);
    }

    Ok(())
}

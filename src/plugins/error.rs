use thiserror::Error;

/// 扩展系统错误类型
#[derive(Error, Debug)]
pub enum ExtensionError {
    #[error("版本号格式错误: {version}")]
    InvalidVersion {
        version: String,
    },

    #[error("扩展 {name} 与当前版本 {app_version} 不兼容")]
    Incompatible {
        name: String,
        app_version: String,
    },

    #[error("清单文件错误: {path} - {message}")]
    ManifestError {
        path: String,
        message: String,
    },

    #[error("加载扩展失败: {name} - {message}")]
    LoadError {
        name: String,
        message: String,
    },

    #[error("扩展 {name} 缺少入口")]
    MissingEntry {
        name: String,
    },

    #[error("初始化扩展失败: {name} - {message}")]
    InitError {
        name: String,
        message: String,
    },

    #[error("执行钩子失败: 扩展 {owner} 在执行 {hook_name} 时出错: {message}")]
    HookError {
        owner: String,
        hook_name: String,
        message: String,
    },

    #[error("扩展路由已挂载，新路由需要重启进程后生效")]
    RoutesAlreadyMounted,

    #[error("扩展不存在: {0}")]
    NotFound(String),

    #[error("扩展已存在: {0}")]
    AlreadyExists(String),

    #[error("系统扩展不能卸载: {0}")]
    SystemExtension(String),

    #[error("存储错误: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("迁移错误: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),
}

/// 把 panic 负载转换为可读的消息
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    match payload.downcast_ref::<&str>() {
        Some(s) => (*s).to_string(),
        None => match payload.downcast_ref::<String>() {
            Some(s) => s.clone(),
            None => "未知错误".to_string(),
        },
    }
}

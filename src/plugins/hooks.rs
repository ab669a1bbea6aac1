//! 进程内的钩子/过滤器总线。
//!
//! 每个工作进程各自持有一份，进程间的一致性只靠注册表对账后整体重建。

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, error, warn};

use super::error::panic_message;
use crate::models::{HookKind, HookRecord};

pub const BEFORE_REQUEST: &str = "before_request";
pub const AFTER_REQUEST: &str = "after_request";
pub const TEMPLATE_CONTEXT: &str = "template_context";
pub const ADMIN_NAVIGATION: &str = "admin_navigation";
pub const SIDEBAR_BOTTOM: &str = "sidebar_bottom";
pub const BEFORE_POST_SAVE: &str = "before_post_save";
pub const AFTER_POST_SAVE: &str = "after_post_save";
pub const BEFORE_POST_DELETE: &str = "before_post_delete";
pub const AFTER_POST_DELETE: &str = "after_post_delete";
pub const BEFORE_COMMENT_SAVE: &str = "before_comment_save";
pub const AFTER_COMMENT_SAVE: &str = "after_comment_save";
pub const AFTER_USER_REGISTER: &str = "after_user_register";
pub const AFTER_USER_LOGIN: &str = "after_user_login";

/// 默认优先级
pub const DEFAULT_PRIORITY: i32 = 10;

pub type ActionFn = Arc<dyn Fn(&[Value]) -> Result<()> + Send + Sync>;
pub type FilterFn = Arc<dyn Fn(Value, &[Value]) -> Result<Value> + Send + Sync>;
pub type TemplateFn = Arc<dyn Fn() -> Result<Value> + Send + Sync>;

/// 钩子回调
#[derive(Clone)]
pub enum HookCallback {
    Action(ActionFn),
    Filter(FilterFn),
    Template(TemplateFn),
}

impl HookCallback {
    pub fn action<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<()> + Send + Sync + 'static,
    {
        HookCallback::Action(Arc::new(f))
    }

    pub fn filter<F>(f: F) -> Self
    where
        F: Fn(Value, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        HookCallback::Filter(Arc::new(f))
    }

    pub fn template<F>(f: F) -> Self
    where
        F: Fn() -> Result<Value> + Send + Sync + 'static,
    {
        HookCallback::Template(Arc::new(f))
    }

    pub fn kind(&self) -> HookKind {
        match self {
            HookCallback::Action(_) => HookKind::Action,
            HookCallback::Filter(_) => HookKind::Filter,
            HookCallback::Template(_) => HookKind::Template,
        }
    }
}

/// 注册选项
#[derive(Debug, Clone)]
pub struct HookOptions {
    /// 数字越小越先执行
    pub priority: i32,
    pub accepted_args: usize,
    pub owner: Option<String>,
}

impl Default for HookOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            accepted_args: 1,
            owner: None,
        }
    }
}

impl HookOptions {
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn accepted_args(mut self, accepted_args: usize) -> Self {
        self.accepted_args = accepted_args;
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

#[derive(Clone)]
struct HookEntry {
    callback: HookCallback,
    priority: i32,
    accepted_args: usize,
    owner: Option<String>,
}

impl HookEntry {
    fn owner_name(&self) -> &str {
        self.owner.as_deref().unwrap_or("unknown")
    }
}

/// 钩子总线
#[derive(Default)]
pub struct HookBus {
    hooks: RwLock<HashMap<String, Vec<HookEntry>>>,
}

impl HookBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<HookEntry>>> {
        self.hooks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<HookEntry>>> {
        self.hooks.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// 注册钩子，列表始终按优先级升序排列，同优先级保持注册顺序
    pub fn register_hook(&self, name: &str, callback: HookCallback, options: HookOptions) {
        let accepted_args = match callback.kind() {
            HookKind::Template => 0,
            _ => options.accepted_args,
        };
        let entry = HookEntry {
            callback,
            priority: options.priority,
            accepted_args,
            owner: options.owner,
        };

        debug!("注册钩子 {} (优先级: {}, 插件: {})", name, entry.priority, entry.owner_name());
        let mut hooks = self.write();
        let list = hooks.entry(name.to_string()).or_default();
        let index = list.partition_point(|e| e.priority <= entry.priority);
        list.insert(index, entry);
    }

    /// 注册模板钩子
    pub fn register_template_hook<F>(&self, name: &str, callback: F, priority: i32, owner: Option<&str>)
    where
        F: Fn() -> Result<Value> + Send + Sync + 'static,
    {
        let mut options = HookOptions::default().priority(priority);
        options.owner = owner.map(String::from);
        self.register_hook(name, HookCallback::template(callback), options);
    }

    /// 复制出某类回调，调用时不持有锁
    fn entries(&self, name: &str, kind: HookKind) -> Vec<HookEntry> {
        self.read()
            .get(name)
            .map(|list| {
                list.iter()
                    .filter(|e| e.callback.kind() == kind)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 执行动作钩子，单个回调失败只记录日志
    pub fn do_action(&self, name: &str, args: &[Value]) {
        for entry in self.entries(name, HookKind::Action) {
            let HookCallback::Action(callback) = &entry.callback else {
                continue;
            };
            let args = &args[..args.len().min(entry.accepted_args)];

            match catch_unwind(AssertUnwindSafe(|| callback(args))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("执行钩子 {} (插件: {}) 失败: {}", name, entry.owner_name(), e);
                }
                Err(payload) => {
                    error!(
                        "执行钩子 {} (插件: {}) 时发生严重错误: {}",
                        name,
                        entry.owner_name(),
                        panic_message(payload.as_ref())
                    );
                }
            }
        }
    }

    /// 应用过滤器，失败的过滤器不改变当前值
    pub fn apply_filters(&self, name: &str, value: Value, args: &[Value]) -> Value {
        self.apply_filters_checked(name, value, args, |_| true)
    }

    /// 同 [`HookBus::apply_filters`]，但某一步的输出不满足 `accept` 时按失败处理，
    /// 保留上一步的值继续执行
    pub fn apply_filters_checked<F>(&self, name: &str, value: Value, args: &[Value], accept: F) -> Value
    where
        F: Fn(&Value) -> bool,
    {
        let mut value = value;
        for entry in self.entries(name, HookKind::Filter) {
            let HookCallback::Filter(callback) = &entry.callback else {
                continue;
            };
            let extra = &args[..args.len().min(entry.accepted_args.saturating_sub(1))];
            let input = value.clone();

            match catch_unwind(AssertUnwindSafe(|| callback(input, extra))) {
                Ok(Ok(next)) if accept(&next) => value = next,
                Ok(Ok(next)) => {
                    warn!("过滤器 {} (插件: {}) 返回了无效的值，已忽略: {}", name, entry.owner_name(), next);
                }
                Ok(Err(e)) => {
                    error!("应用过滤器 {} (插件: {}) 失败: {}", name, entry.owner_name(), e);
                }
                Err(payload) => {
                    error!(
                        "应用过滤器 {} (插件: {}) 时发生严重错误: {}",
                        name,
                        entry.owner_name(),
                        panic_message(payload.as_ref())
                    );
                }
            }
        }
        value
    }

    /// 收集模板钩子的输出，只保留真值
    pub fn get_template_hooks(&self, name: &str) -> Vec<Value> {
        let mut results = Vec::new();
        for entry in self.entries(name, HookKind::Template) {
            let HookCallback::Template(callback) = &entry.callback else {
                continue;
            };
            match catch_unwind(AssertUnwindSafe(|| callback())) {
                Ok(Ok(value)) => {
                    if is_truthy(&value) {
                        results.push(value);
                    }
                }
                Ok(Err(e)) => {
                    error!("获取模板钩子 {} (插件: {}) 失败: {}", name, entry.owner_name(), e);
                }
                Err(payload) => {
                    error!(
                        "获取模板钩子 {} (插件: {}) 时发生严重错误: {}",
                        name,
                        entry.owner_name(),
                        panic_message(payload.as_ref())
                    );
                }
            }
        }
        results
    }

    /// 移除某个扩展注册的全部钩子，返回移除数量
    pub fn remove_owner(&self, owner: &str) -> usize {
        let mut hooks = self.write();
        let mut removed = 0;
        for list in hooks.values_mut() {
            let before = list.len();
            list.retain(|e| e.owner.as_deref() != Some(owner));
            removed += before - list.len();
        }
        hooks.retain(|_, list| !list.is_empty());
        removed
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn has_hook(&self, name: &str) -> bool {
        self.read().get(name).map_or(false, |list| !list.is_empty())
    }

    pub fn len(&self) -> usize {
        self.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hook_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// 某个扩展的钩子元数据
    pub fn registrations(&self, owner: &str) -> Vec<HookRecord> {
        let hooks = self.read();
        let mut records: Vec<HookRecord> = hooks
            .iter()
            .flat_map(|(name, list)| {
                list.iter()
                    .filter(|e| e.owner.as_deref() == Some(owner))
                    .map(move |e| HookRecord {
                        hook_name: name.clone(),
                        hook_type: e.callback.kind(),
                        priority: e.priority,
                        accepted_args: e.accepted_args,
                    })
            })
            .collect();
        records.sort_by(|a, b| a.hook_name.cmp(&b.hook_name).then(a.priority.cmp(&b.priority)));
        records
    }
}

/// 与模板里的真值判断一致
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::json;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> HookCallback) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let calls_clone = calls.clone();
        let make = move |label: &str| {
            let calls = calls_clone.clone();
            let label = label.to_string();
            HookCallback::action(move |_| {
                calls.lock().unwrap().push(label.clone());
                Ok(())
            })
        };
        (calls, make)
    }

    #[test]
    fn test_actions_run_in_priority_order_with_stable_ties() {
        let bus = HookBus::new();
        let (calls, make) = recorder();
        bus.register_hook("init", make("late"), HookOptions::default().priority(20));
        bus.register_hook("init", make("first-10"), HookOptions::default());
        bus.register_hook("init", make("early"), HookOptions::default().priority(1));
        bus.register_hook("init", make("second-10"), HookOptions::default());

        bus.do_action("init", &[]);
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["early", "first-10", "second-10", "late"]
        );
    }

    #[test]
    fn test_failing_action_does_not_stop_others() {
        let bus = HookBus::new();
        let (calls, make) = recorder();
        bus.register_hook("save", make("one"), HookOptions::default().priority(1));
        bus.register_hook(
            "save",
            HookCallback::action(|_| Err(anyhow!("boom"))),
            HookOptions::default().priority(2).owner("broken"),
        );
        bus.register_hook("save", make("three"), HookOptions::default().priority(3));

        bus.do_action("save", &[json!(1)]);
        assert_eq!(*calls.lock().unwrap(), vec!["one", "three"]);
    }

    #[test]
    fn test_panicking_action_does_not_stop_others() {
        let bus = HookBus::new();
        let (calls, make) = recorder();
        bus.register_hook("save", make("one"), HookOptions::default().priority(1));
        bus.register_hook(
            "save",
            HookCallback::action(|_| panic!("callback exploded")),
            HookOptions::default().priority(2),
        );
        bus.register_hook("save", make("three"), HookOptions::default().priority(3));

        bus.do_action("save", &[]);
        assert_eq!(*calls.lock().unwrap(), vec!["one", "three"]);
    }

    #[test]
    fn test_action_args_truncated_to_accepted_args() {
        let bus = HookBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for accepted in [0usize, 1, 5] {
            let seen = seen.clone();
            bus.register_hook(
                "after_post_save",
                HookCallback::action(move |args| {
                    seen.lock().unwrap().push(args.len());
                    Ok(())
                }),
                HookOptions::default().accepted_args(accepted),
            );
        }

        bus.do_action("after_post_save", &[json!("post"), json!("user")]);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_filters_without_callbacks_return_value() {
        let bus = HookBus::new();
        assert_eq!(bus.apply_filters("page_title", json!("标题"), &[]), json!("标题"));
    }

    #[test]
    fn test_failing_filter_keeps_previous_value() {
        let bus = HookBus::new();
        bus.register_hook(
            "number",
            HookCallback::filter(|v, _| Ok(json!(v.as_i64().unwrap_or(0) * 2))),
            HookOptions::default().priority(1),
        );
        bus.register_hook(
            "number",
            HookCallback::filter(|_, _| Err(anyhow!("bad filter"))),
            HookOptions::default().priority(2),
        );
        bus.register_hook(
            "number",
            HookCallback::filter(|v, _| Ok(json!(v.as_i64().unwrap_or(0) + 1))),
            HookOptions::default().priority(3),
        );

        assert_eq!(bus.apply_filters("number", json!(2), &[]), json!(5));
    }

    #[test]
    fn test_rejected_filter_step_keeps_previous_value() {
        let bus = HookBus::new();
        bus.register_hook(
            "context",
            HookCallback::filter(|mut v, _| {
                v["a"] = json!(1);
                Ok(v)
            }),
            HookOptions::default().priority(1),
        );
        bus.register_hook(
            "context",
            HookCallback::filter(|_, _| Ok(json!("oops"))),
            HookOptions::default().priority(2),
        );
        bus.register_hook(
            "context",
            HookCallback::filter(|mut v, _| {
                v["b"] = json!(2);
                Ok(v)
            }),
            HookOptions::default().priority(3),
        );

        let result = bus.apply_filters_checked("context", json!({}), &[], Value::is_object);
        assert_eq!(result, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_filter_receives_extra_args() {
        let bus = HookBus::new();
        bus.register_hook(
            "post_content",
            HookCallback::filter(|v, args| {
                let suffix = args.first().and_then(Value::as_str).unwrap_or("-");
                Ok(json!(format!("{}{}", v.as_str().unwrap_or(""), suffix)))
            }),
            HookOptions::default().accepted_args(2),
        );

        let out = bus.apply_filters("post_content", json!("正文"), &[json!("!"), json!("ignored")]);
        assert_eq!(out, json!("正文!"));
    }

    #[test]
    fn test_actions_and_filters_are_separate() {
        let bus = HookBus::new();
        let (calls, make) = recorder();
        bus.register_hook("mixed", make("action"), HookOptions::default());
        bus.register_hook(
            "mixed",
            HookCallback::filter(|_, _| Ok(json!("filtered"))),
            HookOptions::default(),
        );

        assert_eq!(bus.apply_filters("mixed", json!("raw"), &[]), json!("filtered"));
        assert!(calls.lock().unwrap().is_empty());
        bus.do_action("mixed", &[]);
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_template_hooks_collect_truthy_results() {
        let bus = HookBus::new();
        bus.register_template_hook(SIDEBAR_BOTTOM, || Ok(json!("<div>友情链接</div>")), 10, Some("links"));
        bus.register_template_hook(SIDEBAR_BOTTOM, || Ok(json!("")), 10, None);
        bus.register_template_hook(SIDEBAR_BOTTOM, || Err(anyhow!("widget failed")), 5, None);
        bus.register_template_hook(SIDEBAR_BOTTOM, || Ok(Value::Null), 1, None);

        assert_eq!(bus.get_template_hooks(SIDEBAR_BOTTOM), vec![json!("<div>友情链接</div>")]);
        assert_eq!(bus.registrations("links")[0].accepted_args, 0);
    }

    #[test]
    fn test_remove_owner_and_clear() {
        let bus = HookBus::new();
        let (_, make) = recorder();
        bus.register_hook("a", make("x"), HookOptions::default().owner("seo"));
        bus.register_hook("b", make("y"), HookOptions::default().owner("seo"));
        bus.register_hook("b", make("z"), HookOptions::default().owner("links"));

        assert_eq!(bus.remove_owner("seo"), 2);
        assert!(!bus.has_hook("a"));
        assert_eq!(bus.len(), 1);
        assert_eq!(bus.hook_names(), vec!["b".to_string()]);

        bus.clear();
        assert!(bus.is_empty());
    }

    #[test]
    fn test_callback_may_register_hooks() {
        let bus = Arc::new(HookBus::new());
        let inner = bus.clone();
        bus.register_hook(
            "init",
            HookCallback::action(move |_| {
                inner.register_hook("late", HookCallback::action(|_| Ok(())), HookOptions::default());
                Ok(())
            }),
            HookOptions::default(),
        );

        bus.do_action("init", &[]);
        assert!(bus.has_hook("late"));
    }

    #[test]
    fn test_is_truthy() {
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!([])));
        assert!(!is_truthy(&json!({})));
        assert!(is_truthy(&json!({"a": 1})));
        assert!(is_truthy(&json!(true)));
    }
}

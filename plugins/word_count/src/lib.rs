use anyhow::Result;
use noteblog::export_extension;
use noteblog::plugins::{Extension, ExtensionContext};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

/// 字数统计插件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct WordCountConfig {
    /// 是否显示字数
    show_word_count: bool,
    /// 是否显示阅读时间
    show_read_time: bool,
    /// 每分钟阅读字数
    words_per_minute: u32,
}

impl Default for WordCountConfig {
    fn default() -> Self {
        Self {
            show_word_count: true,
            show_read_time: true,
            words_per_minute: 200,
        }
    }
}

/// 字数统计插件
#[derive(Default)]
pub struct WordCountPlugin;

/// 统计英文单词和中文字符
fn count_words(content: &str) -> usize {
    let english_words = content
        .split_whitespace()
        .filter(|w| w.chars().any(|c| c.is_ascii_alphanumeric()))
        .count();
    let chinese_chars = content.chars().filter(|c| is_cjk(*c)).count();
    english_words + chinese_chars
}

fn is_cjk(c: char) -> bool {
    let cp = c as u32;
    (0x4E00..=0x9FFF).contains(&cp) || (0x3400..=0x4DBF).contains(&cp) || (0xF900..=0xFAFF).contains(&cp)
}

/// 阅读时间（分钟），至少 1 分钟
fn read_time(words: usize, words_per_minute: u32) -> usize {
    let per_minute = words_per_minute.max(1) as usize;
    words.div_ceil(per_minute).max(1)
}

impl Extension for WordCountPlugin {
    fn name(&self) -> &str {
        "word_count"
    }

    fn version(&self) -> &str {
        "0.1.0"
    }

    fn description(&self) -> &str {
        "文章字数统计插件"
    }

    fn register(&self, ctx: &mut ExtensionContext<'_>) -> Result<()> {
        let config: WordCountConfig = serde_json::from_value(ctx.config().clone()).unwrap_or_default();
        debug!("字数统计插件配置: {:?}", config);

        let wpm = config.words_per_minute;
        ctx.add_filter("template_context", 10, 1, move |mut context, _| {
            let words = context.get("content").and_then(Value::as_str).map(count_words);
            if let (Some(words), Some(map)) = (words, context.as_object_mut()) {
                map.insert("word_count".to_string(), json!(words));
                map.insert("read_time".to_string(), json!(read_time(words, wpm)));
            }
            Ok(context)
        });

        if config.show_word_count || config.show_read_time {
            ctx.add_filter("post_content", 20, 1, move |content, _| {
                let Some(text) = content.as_str() else {
                    return Ok(content);
                };
                let words = count_words(text);
                let mut parts = Vec::new();
                if config.show_word_count {
                    parts.push(format!("字数: {}", words));
                }
                if config.show_read_time {
                    parts.push(format!("阅读时间: {} 分钟", read_time(words, config.words_per_minute)));
                }
                Ok(json!(format!("{}\n<p class=\"word-count\">{}</p>", text, parts.join(" · "))))
            });
        }
        Ok(())
    }

    fn default_config(&self) -> Option<Value> {
        serde_json::to_value(WordCountConfig::default()).ok()
    }
}

export_extension!(WordCountPlugin);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_words_mixes_english_and_chinese() {
        assert_eq!(count_words("hello world"), 2);
        assert_eq!(count_words("你好 world"), 3);
        assert_eq!(count_words("  "), 0);
    }

    #[test]
    fn test_read_time_is_at_least_one_minute() {
        assert_eq!(read_time(0, 200), 1);
        assert_eq!(read_time(401, 200), 3);
        assert_eq!(read_time(10, 0), 10);
    }
}

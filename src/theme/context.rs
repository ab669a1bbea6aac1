//! 渲染基础上下文用到的站点数据。

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::SqlitePool;

/// 站点内容的只读查询
#[derive(Clone)]
pub struct SiteData {
    pool: SqlitePool,
    recent_posts_limit: i64,
}

impl SiteData {
    pub fn new(pool: SqlitePool, recent_posts_limit: i64) -> Self {
        Self { pool, recent_posts_limit }
    }

    /// 最近发布的文章，按发布时间倒序
    pub async fn recent_posts(&self) -> Result<Value, sqlx::Error> {
        let rows = sqlx::query_as::<_, (i64, String, String, Option<String>, Option<DateTime<Utc>>)>(
            "SELECT id, title, slug, summary, published_at FROM posts \
             WHERE status = 'published' ORDER BY published_at DESC, id DESC LIMIT ?",
        )
        .bind(self.recent_posts_limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(Value::Array(
            rows.into_iter()
                .map(|(id, title, slug, summary, published_at)| {
                    json!({
                        "id": id,
                        "title": title,
                        "slug": slug,
                        "summary": summary,
                        "published_at": published_at.map(|d| d.to_rfc3339()),
                    })
                })
                .collect(),
        ))
    }

    pub async fn categories(&self) -> Result<Value, sqlx::Error> {
        let rows = sqlx::query_as::<_, (i64, String, String)>(
            "SELECT id, name, slug FROM categories WHERE is_active = 1 ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(Value::Array(
            rows.into_iter()
                .map(|(id, name, slug)| json!({"id": id, "name": name, "slug": slug}))
                .collect(),
        ))
    }

    pub async fn tags(&self) -> Result<Value, sqlx::Error> {
        let rows = sqlx::query_as::<_, (i64, String, String)>("SELECT id, name, slug FROM tags ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(Value::Array(
            rows.into_iter()
                .map(|(id, name, slug)| json!({"id": id, "name": name, "slug": slug}))
                .collect(),
        ))
    }

    pub async fn setting(&self, key: &str) -> Result<Option<String>, sqlx::Error> {
        let value = sqlx::query_scalar::<_, Option<String>>("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value.flatten())
    }
}

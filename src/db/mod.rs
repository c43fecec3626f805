//! Database module

mod schema;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite, SqlitePool};

use crate::config::DatabaseConfig;

/// Shop value for rules that apply to every shop. Only the bot resolver
/// consults this tier.
pub const GLOBAL_SHOP: &str = "*";

/// What an access rule matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Bot,
    Ip,
    Country,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Bot => "bot",
            RuleKind::Ip => "ip",
            RuleKind::Country => "country",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bot" => Some(RuleKind::Bot),
            "ip" => Some(RuleKind::Ip),
            "country" => Some(RuleKind::Country),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListType {
    Whitelist,
    Blacklist,
}

impl ListType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListType::Whitelist => "whitelist",
            ListType::Blacklist => "blacklist",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "whitelist" => Some(ListType::Whitelist),
            "blacklist" => Some(ListType::Blacklist),
            _ => None,
        }
    }
}

/// A whitelist/blacklist entry scoped to one shop (or to [`GLOBAL_SHOP`]).
#[derive(Debug, Clone, Serialize)]
pub struct AccessRule {
    pub id: i64,
    pub shop: String,
    pub kind: RuleKind,
    pub subject: String,
    pub list_type: ListType,
    pub enabled: bool,
    pub note: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

type RuleRow = (
    i64,
    String,
    String,
    String,
    String,
    i64,
    Option<String>,
    i64,
    i64,
);

fn rule_from_row(row: RuleRow) -> Option<AccessRule> {
    let (id, shop, kind, subject, list_type, enabled, note, created_at, updated_at) = row;
    Some(AccessRule {
        id,
        shop,
        kind: RuleKind::parse(&kind)?,
        subject,
        list_type: ListType::parse(&list_type)?,
        enabled: enabled != 0,
        note,
        created_at,
        updated_at,
    })
}

const RULE_COLUMNS: &str =
    "id, shop, kind, subject, list_type, enabled, note, created_at, updated_at";

/// Signals captured for a new visit row.
#[derive(Debug, Clone)]
pub struct NewVisit {
    pub shop: String,
    pub session_id: String,
    pub ip_address: String,
    pub country_code: Option<String>,
    pub user_agent: String,
    pub device_type: String,
    pub browser_name: String,
    pub browser_version: String,
    pub page_url: String,
    pub referrer: Option<String>,
    pub visit_duration: i64,
    pub is_bot: bool,
    pub bot_name: Option<String>,
    pub blocked_reason: Option<String>,
}

/// A visit row as returned to the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct VisitSummary {
    pub id: i64,
    pub session_id: String,
    pub ip_address: String,
    pub country_code: Option<String>,
    pub device_type: String,
    pub browser_name: String,
    pub page_url: String,
    pub referrer: Option<String>,
    pub page_views: i64,
    pub visit_duration: i64,
    pub is_bot: bool,
    pub bot_name: Option<String>,
    pub blocked_reason: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CountryStat {
    pub country_code: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReasonStat {
    pub reason: String,
    pub count: i64,
}

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        // ":memory:" databases are per-connection, so they get a single
        // connection; file databases use the default pool.
        let pool = if config.url == ":memory:" {
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect("sqlite::memory:")
                .await?
        } else {
            SqlitePool::connect(&format!("sqlite:{}?mode=rwc", config.url)).await?
        };
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        // Enable WAL mode for better concurrency
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;

        sqlx::query(schema::CREATE_RULES_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_SESSIONS_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_INDEX_RULES_SHOP_KIND)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_INDEX_SESSIONS_LOOKUP)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_INDEX_SESSIONS_SHOP_TS)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // === Access rules ===

    pub async fn create_rule(
        &self,
        shop: &str,
        kind: RuleKind,
        subject: &str,
        list_type: ListType,
        enabled: bool,
        note: Option<&str>,
    ) -> Result<i64> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO access_rules (shop, kind, subject, list_type, enabled, note, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(shop)
        .bind(kind.as_str())
        .bind(subject)
        .bind(list_type.as_str())
        .bind(enabled as i64)
        .bind(note)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_rule(&self, id: i64) -> Result<Option<AccessRule>> {
        let row: Option<RuleRow> = sqlx::query_as(&format!(
            "SELECT {RULE_COLUMNS} FROM access_rules WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(rule_from_row))
    }

    pub async fn list_rules(&self, shop: &str, kind: Option<RuleKind>) -> Result<Vec<AccessRule>> {
        let rows: Vec<RuleRow> = match kind {
            Some(kind) => {
                sqlx::query_as(&format!(
                    "SELECT {RULE_COLUMNS} FROM access_rules WHERE shop = ? AND kind = ? ORDER BY id"
                ))
                .bind(shop)
                .bind(kind.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {RULE_COLUMNS} FROM access_rules WHERE shop = ? ORDER BY id"
                ))
                .bind(shop)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows.into_iter().filter_map(rule_from_row).collect())
    }

    /// All enabled rules of one kind for one shop. Resolvers apply the
    /// matching and tie-break logic in code, not in SQL.
    pub async fn enabled_rules(&self, shop: &str, kind: RuleKind) -> Result<Vec<AccessRule>> {
        let rows: Vec<RuleRow> = sqlx::query_as(&format!(
            "SELECT {RULE_COLUMNS} FROM access_rules WHERE shop = ? AND kind = ? AND enabled = 1 ORDER BY id"
        ))
        .bind(shop)
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().filter_map(rule_from_row).collect())
    }

    /// Whether the shop has any enabled whitelist rule of this kind. Drives
    /// "whitelist mode" for the IP and country resolvers.
    pub async fn has_enabled_whitelist(&self, shop: &str, kind: RuleKind) -> Result<bool> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM access_rules WHERE shop = ? AND kind = ? AND list_type = 'whitelist' AND enabled = 1",
        )
        .bind(shop)
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 > 0)
    }

    pub async fn update_rule(
        &self,
        id: i64,
        enabled: Option<bool>,
        list_type: Option<ListType>,
        note: Option<&str>,
    ) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE access_rules
            SET enabled = COALESCE(?, enabled),
                list_type = COALESCE(?, list_type),
                note = COALESCE(?, note),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(enabled.map(|e| e as i64))
        .bind(list_type.map(|t| t.as_str()))
        .bind(note)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_rule(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM access_rules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // === Visit sessions ===

    /// Most recent session row for (shop, session_id) created after the
    /// cutoff, if any.
    pub async fn find_recent_session(
        &self,
        shop: &str,
        session_id: &str,
        cutoff_ms: i64,
    ) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT id FROM visit_sessions
            WHERE shop = ? AND session_id = ? AND created_at > ?
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(shop)
        .bind(session_id)
        .bind(cutoff_ms)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    pub async fn insert_session(&self, visit: &NewVisit) -> Result<i64> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO visit_sessions
                (shop, session_id, ip_address, country_code, user_agent, device_type,
                 browser_name, browser_version, page_url, referrer, visit_duration,
                 page_views, is_bot, bot_name, blocked_reason, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&visit.shop)
        .bind(&visit.session_id)
        .bind(&visit.ip_address)
        .bind(&visit.country_code)
        .bind(&visit.user_agent)
        .bind(&visit.device_type)
        .bind(&visit.browser_name)
        .bind(&visit.browser_version)
        .bind(&visit.page_url)
        .bind(&visit.referrer)
        .bind(visit.visit_duration)
        .bind(visit.is_bot as i64)
        .bind(&visit.bot_name)
        .bind(&visit.blocked_reason)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Merge a repeat page view into an existing session row. The page-view
    /// increment happens in SQL so concurrent requests cannot lose counts.
    /// Leaves visit_duration alone; only the beacon owns that counter.
    pub async fn touch_session(&self, id: i64, page_url: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            UPDATE visit_sessions
            SET page_views = page_views + 1,
                page_url = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(page_url)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Beacon merge: refresh the duration without bumping page_views.
    pub async fn update_session_duration(&self, id: i64, visit_duration: i64) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            "UPDATE visit_sessions SET visit_duration = ?, updated_at = ? WHERE id = ?",
        )
        .bind(visit_duration)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // === Stats (admin reporting) ===

    pub async fn get_visit_count(&self, shop: &str, since_hours: i64) -> Result<i64> {
        let since = Utc::now().timestamp_millis() - (since_hours * 3600 * 1000);
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM visit_sessions WHERE shop = ? AND created_at > ?",
        )
        .bind(shop)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    pub async fn get_unique_visitors(&self, shop: &str, since_hours: i64) -> Result<i64> {
        let since = Utc::now().timestamp_millis() - (since_hours * 3600 * 1000);
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(DISTINCT ip_address) FROM visit_sessions WHERE shop = ? AND created_at > ?",
        )
        .bind(shop)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    pub async fn get_blocked_count(&self, shop: &str, since_hours: i64) -> Result<i64> {
        let since = Utc::now().timestamp_millis() - (since_hours * 3600 * 1000);
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM visit_sessions WHERE shop = ? AND created_at > ? AND blocked_reason IS NOT NULL",
        )
        .bind(shop)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    pub async fn get_bot_count(&self, shop: &str, since_hours: i64) -> Result<i64> {
        let since = Utc::now().timestamp_millis() - (since_hours * 3600 * 1000);
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM visit_sessions WHERE shop = ? AND created_at > ? AND is_bot = 1",
        )
        .bind(shop)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    pub async fn get_country_stats(&self, shop: &str, since_hours: i64) -> Result<Vec<CountryStat>> {
        let since = Utc::now().timestamp_millis() - (since_hours * 3600 * 1000);
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT country_code, COUNT(*) as count
            FROM visit_sessions
            WHERE shop = ? AND created_at > ? AND country_code IS NOT NULL
            GROUP BY country_code
            ORDER BY count DESC
            "#,
        )
        .bind(shop)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(country_code, count)| CountryStat { country_code, count })
            .collect())
    }

    pub async fn get_blocked_reason_stats(
        &self,
        shop: &str,
        since_hours: i64,
        limit: i32,
    ) -> Result<Vec<ReasonStat>> {
        let since = Utc::now().timestamp_millis() - (since_hours * 3600 * 1000);
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT blocked_reason, COUNT(*) as count
            FROM visit_sessions
            WHERE shop = ? AND created_at > ? AND blocked_reason IS NOT NULL
            GROUP BY blocked_reason
            ORDER BY count DESC
            LIMIT ?
            "#,
        )
        .bind(shop)
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(reason, count)| ReasonStat { reason, count })
            .collect())
    }

    pub async fn get_recent_sessions(&self, shop: &str, limit: i32) -> Result<Vec<VisitSummary>> {
        let rows: Vec<(
            i64,
            String,
            String,
            Option<String>,
            String,
            String,
            String,
            Option<String>,
            i64,
            i64,
            i64,
            Option<String>,
            Option<String>,
            i64,
        )> = sqlx::query_as(
            r#"
            SELECT id, session_id, ip_address, country_code, device_type, browser_name,
                   page_url, referrer, page_views, visit_duration, is_bot, bot_name,
                   blocked_reason, created_at
            FROM visit_sessions
            WHERE shop = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(shop)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(
                    id,
                    session_id,
                    ip_address,
                    country_code,
                    device_type,
                    browser_name,
                    page_url,
                    referrer,
                    page_views,
                    visit_duration,
                    is_bot,
                    bot_name,
                    blocked_reason,
                    created_at,
                )| VisitSummary {
                    id,
                    session_id,
                    ip_address,
                    country_code,
                    device_type,
                    browser_name,
                    page_url,
                    referrer,
                    page_views,
                    visit_duration,
                    is_bot: is_bot != 0,
                    bot_name,
                    blocked_reason,
                    created_at,
                },
            )
            .collect())
    }

    /// Uninstall cleanup: drop everything the shop owns.
    pub async fn delete_shop_data(&self, shop: &str) -> Result<(u64, u64)> {
        let rules = sqlx::query("DELETE FROM access_rules WHERE shop = ?")
            .bind(shop)
            .execute(&self.pool)
            .await?
            .rows_affected();
        let sessions = sqlx::query("DELETE FROM visit_sessions WHERE shop = ?")
            .bind(shop)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok((rules, sessions))
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[cfg(test)]
pub(crate) async fn test_db() -> Database {
    let config = DatabaseConfig {
        driver: "sqlite".to_string(),
        url: ":memory:".to_string(),
    };
    let db = Database::new(&config).await.expect("open in-memory db");
    db.run_migrations().await.expect("migrations");
    db
}

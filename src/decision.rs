//! Access decision orchestration
//!
//! Sequences bot, IP, and country checks, short-circuiting on the first
//! block, then records the visit. The ordering is a correctness requirement
//! for short-circuit semantics: a whitelisted bot from a blocked country is
//! blocked by geography; a blocked bot is never geography-checked.
//!
//! Failure stance: visitor experience beats enforcement strictness. Any
//! datastore failure or timeout inside a check degrades that check to
//! "not blocked", and any unexpected error in the orchestration as a whole
//! fails open to an allow verdict.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;

use crate::analytics;
use crate::bots;
use crate::config::AccessConfig;
use crate::db::Database;
use crate::rules::{self, ListDecision};
use crate::signals::ClientSignals;

/// Final allow/block verdict for one request. Ephemeral, never persisted
/// as-is; the recorder copies the fields it keeps.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Verdict {
    pub blocked: bool,
    pub reason: Option<String>,
    pub session_id: String,
    pub country_code: Option<String>,
    pub device_type: String,
    pub browser_name: String,
    pub is_bot: bool,
    pub bot_name: Option<String>,
    pub ip: String,
}

impl Verdict {
    pub fn allow(signals: &ClientSignals, is_bot: bool, bot_name: Option<String>) -> Self {
        Self::build(signals, None, is_bot, bot_name)
    }

    pub fn block(
        signals: &ClientSignals,
        reason: impl Into<String>,
        is_bot: bool,
        bot_name: Option<String>,
    ) -> Self {
        Self::build(signals, Some(reason.into()), is_bot, bot_name)
    }

    fn build(
        signals: &ClientSignals,
        reason: Option<String>,
        is_bot: bool,
        bot_name: Option<String>,
    ) -> Self {
        let (browser_name, _) = crate::signals::browser(&signals.user_agent);
        Self {
            blocked: reason.is_some(),
            reason,
            session_id: signals.session_id.clone(),
            country_code: signals.country_code.clone(),
            device_type: crate::signals::device_type(&signals.user_agent).to_string(),
            browser_name: browser_name.to_string(),
            is_bot,
            bot_name,
            ip: signals.ip.clone(),
        }
    }
}

/// Run the full pipeline for one request and record the visit.
///
/// This is the fail-open boundary: whatever goes wrong inside, the caller
/// gets a verdict, and an error can only ever make it an allow.
pub async fn check_access(db: &Database, cfg: &AccessConfig, signals: &ClientSignals) -> Verdict {
    // No tenant, no decision: never block a shop we cannot identify,
    // and never attribute a visit row to one either.
    let Some(shop) = signals.shop.clone() else {
        let m = bots::classify(&signals.user_agent);
        return Verdict::allow(signals, m.is_bot, m.name);
    };

    let verdict = match decide(db, cfg, &shop, signals).await {
        Ok(verdict) => verdict,
        Err(e) => {
            tracing::warn!("Access check failed for {}, allowing: {}", shop, e);
            let m = bots::classify(&signals.user_agent);
            Verdict::allow(signals, m.is_bot, m.name)
        }
    };

    // The recorder always runs and swallows its own failures.
    analytics::record(db, cfg.session_window_minutes, &shop, signals, &verdict).await;

    if verdict.blocked {
        tracing::info!(
            "Blocked {} from {} ({}): {}",
            signals.ip,
            shop,
            verdict.bot_name.as_deref().unwrap_or("human"),
            verdict.reason.as_deref().unwrap_or("")
        );
    }

    verdict
}

async fn decide(
    db: &Database,
    cfg: &AccessConfig,
    shop: &str,
    signals: &ClientSignals,
) -> Result<Verdict> {
    let timeout_ms = cfg.check_timeout_ms;
    let bot = bots::classify(&signals.user_agent);

    // Bot check first
    if bot.is_bot {
        let decision = checked(timeout_ms, "bot", rules::resolve_bot(db, shop, &signals.user_agent)).await;
        if decision.blocked {
            return Ok(Verdict::block(
                signals,
                decision.reason.unwrap_or_default(),
                true,
                bot.name,
            ));
        }
    }

    // Then IP
    let decision = checked(timeout_ms, "ip", rules::resolve_ip(db, cfg, shop, &signals.ip)).await;
    if decision.blocked {
        return Ok(Verdict::block(
            signals,
            decision.reason.unwrap_or_default(),
            bot.is_bot,
            bot.name,
        ));
    }

    // Then country, when we have one. Country is only as trustworthy as the
    // edge header or the client-supplied parameter.
    if let Some(country) = &signals.country_code {
        let decision = checked(timeout_ms, "country", rules::resolve_country(db, shop, country)).await;
        if decision.blocked {
            return Ok(Verdict::block(
                signals,
                decision.reason.unwrap_or_default(),
                bot.is_bot,
                bot.name,
            ));
        }
    }

    Ok(Verdict::allow(signals, bot.is_bot, bot.name))
}

/// Bound one check with a timeout and degrade any failure to "allowed".
async fn checked<F>(timeout_ms: u64, what: &str, fut: F) -> ListDecision
where
    F: Future<Output = Result<ListDecision>>,
{
    match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
        Ok(Ok(decision)) => decision,
        Ok(Err(e)) => {
            tracing::warn!("{} check failed, treating as not blocked: {}", what, e);
            ListDecision::allowed()
        }
        Err(_) => {
            tracing::warn!("{} check timed out after {}ms, treating as not blocked", what, timeout_ms);
            ListDecision::allowed()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{test_db, ListType, RuleKind};

    const CHROME_UA: &str =
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

    fn signals(shop: Option<&str>, ua: &str, ip: &str, country: Option<&str>) -> ClientSignals {
        ClientSignals {
            ip: ip.to_string(),
            user_agent: ua.to_string(),
            shop: shop.map(|s| s.to_string()),
            country_code: country.map(|c| c.to_string()),
            page_url: "/".to_string(),
            referrer: None,
            session_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    #[tokio::test]
    async fn missing_shop_always_allows() {
        let db = test_db().await;
        let cfg = AccessConfig::default();
        let s = signals(None, "SomeScraperBot/1.0", "203.0.113.1", Some("CN"));
        let verdict = check_access(&db, &cfg, &s).await;
        assert!(!verdict.blocked);
        // And nothing was recorded without a tenant
        assert!(db.get_recent_sessions("", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ip_block_wins_before_country_is_consulted() {
        let db = test_db().await;
        let cfg = AccessConfig::default();
        db.create_rule("d-s1.example", RuleKind::Ip, "203.0.113.5", ListType::Blacklist, true, None)
            .await
            .unwrap();
        // A country blacklist that would also match; the IP reason must win
        db.create_rule("d-s1.example", RuleKind::Country, "US", ListType::Blacklist, true, None)
            .await
            .unwrap();

        let s = signals(Some("d-s1.example"), CHROME_UA, "203.0.113.5", Some("US"));
        let verdict = check_access(&db, &cfg, &s).await;
        assert!(verdict.blocked);
        assert!(verdict.reason.as_deref().unwrap().contains("IP"));
    }

    #[tokio::test]
    async fn blocked_bot_is_never_geography_checked() {
        let db = test_db().await;
        let cfg = AccessConfig::default();
        db.create_rule("d-bot.example", RuleKind::Country, "DE", ListType::Blacklist, true, None)
            .await
            .unwrap();

        let s = signals(Some("d-bot.example"), "SomeScraperBot/1.0", "203.0.113.1", Some("DE"));
        let verdict = check_access(&db, &cfg, &s).await;
        assert!(verdict.blocked);
        assert!(verdict.reason.as_deref().unwrap().contains("Bot"));
        assert!(verdict.is_bot);
    }

    #[tokio::test]
    async fn whitelisted_bot_still_faces_country_check() {
        let db = test_db().await;
        let cfg = AccessConfig::default();
        db.create_rule("d-geo.example", RuleKind::Bot, "googlebot", ListType::Whitelist, true, None)
            .await
            .unwrap();
        db.create_rule("d-geo.example", RuleKind::Country, "RU", ListType::Blacklist, true, None)
            .await
            .unwrap();

        let s = signals(
            Some("d-geo.example"),
            "Mozilla/5.0 (compatible; Googlebot/2.1)",
            "203.0.113.1",
            Some("RU"),
        );
        let verdict = check_access(&db, &cfg, &s).await;
        assert!(verdict.blocked);
        assert!(verdict.reason.as_deref().unwrap().contains("Country"));
    }

    #[tokio::test]
    async fn zero_rule_shop_allows_humans_but_not_unknown_bots() {
        let db = test_db().await;
        let cfg = AccessConfig::default();

        let human = signals(Some("d-s3.example"), CHROME_UA, "203.0.113.7", Some("BR"));
        assert!(!check_access(&db, &cfg, &human).await.blocked);

        let bot = signals(Some("d-s3.example"), "SomeScraperBot/1.0", "203.0.113.7", Some("BR"));
        let verdict = check_access(&db, &cfg, &bot).await;
        assert!(verdict.blocked);
        assert!(verdict.reason.as_deref().unwrap().contains("Bot"));
    }

    #[tokio::test]
    async fn verdicts_are_recorded_with_the_winning_reason() {
        let db = test_db().await;
        let cfg = AccessConfig::default();
        db.create_rule("d-rec.example", RuleKind::Ip, "203.0.113.5", ListType::Blacklist, true, None)
            .await
            .unwrap();

        let s = signals(Some("d-rec.example"), CHROME_UA, "203.0.113.5", None);
        check_access(&db, &cfg, &s).await;

        let rows = db.get_recent_sessions("d-rec.example", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].blocked_reason.as_deref().unwrap().contains("IP"));
    }
}

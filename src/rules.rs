//! List resolution: whitelist/blacklist lookups per shop
//!
//! Three resolvers share one shape but differ deliberately in default
//! policy:
//! - bots are whitelist-only: an unmatched bot is blocked, even for a shop
//!   with zero bot rules;
//! - IPs and countries default-allow, unless the shop has at least one
//!   enabled whitelist rule of that kind ("whitelist mode"), in which case
//!   unmatched subjects are blocked.
//!
//! Only the bot resolver falls back to the global ("*") rule tier.

use anyhow::Result;
use cached::proc_macro::cached;

use crate::config::AccessConfig;
use crate::db::{AccessRule, Database, ListType, RuleKind, GLOBAL_SHOP};
use crate::signals::is_private_ip;

/// Outcome of one list check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListDecision {
    pub blocked: bool,
    pub reason: Option<String>,
}

impl ListDecision {
    pub fn allowed() -> Self {
        Self {
            blocked: false,
            reason: None,
        }
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            blocked: true,
            reason: Some(reason.into()),
        }
    }
}

/// Named tie-break: when both a whitelist and a blacklist rule match the
/// same subject, the whitelist rule wins. The original system got this from
/// "whitelist" sorting after "blacklist" in an ORDER BY; here it is explicit.
fn prefer_whitelist<'a>(matches: &[&'a AccessRule]) -> Option<&'a AccessRule> {
    matches
        .iter()
        .find(|r| r.list_type == ListType::Whitelist)
        .or_else(|| matches.first())
        .copied()
}

/// Cached per-shop whitelist-mode flag. Rule edits are rare and
/// stale-by-seconds visibility is acceptable for a blocking feature, so a
/// short TTL avoids a count query on every unmatched lookup. Errors count
/// as "not in whitelist mode" (fail open).
#[cached(
    time = 30,
    key = "String",
    convert = r#"{ format!("{}:{}", shop, kind.as_str()) }"#
)]
async fn whitelist_mode(shop: String, kind: RuleKind, db: Database) -> bool {
    match db.has_enabled_whitelist(&shop, kind).await {
        Ok(mode) => mode,
        Err(e) => {
            tracing::warn!("whitelist-mode lookup failed for {}: {}", shop, e);
            false
        }
    }
}

/// Resolve a classified bot against the shop's bot rules, then the global
/// tier. Subject matching is substring containment in the lowercased UA.
/// No match at all means blocked: bot access is whitelist-only.
pub async fn resolve_bot(db: &Database, shop: &str, user_agent: &str) -> Result<ListDecision> {
    let ua = user_agent.to_lowercase();

    for tier in [shop, GLOBAL_SHOP] {
        let rules = db.enabled_rules(tier, RuleKind::Bot).await?;
        let matches: Vec<&AccessRule> = rules
            .iter()
            .filter(|r| ua.contains(&r.subject.to_lowercase()))
            .collect();
        if let Some(rule) = prefer_whitelist(&matches) {
            return Ok(match rule.list_type {
                ListType::Whitelist => ListDecision::allowed(),
                ListType::Blacklist => ListDecision::blocked(
                    rule.note
                        .clone()
                        .unwrap_or_else(|| "Bot access blocked".to_string()),
                ),
            });
        }
    }

    Ok(ListDecision::blocked("Unknown Bot - not whitelisted"))
}

/// Resolve a client IP against the shop's IP rules (exact match, no global
/// tier). In development, private and loopback addresses bypass the check.
pub async fn resolve_ip(
    db: &Database,
    cfg: &AccessConfig,
    shop: &str,
    ip: &str,
) -> Result<ListDecision> {
    if cfg.is_development() && is_private_ip(ip) {
        return Ok(ListDecision::allowed());
    }

    let rules = db.enabled_rules(shop, RuleKind::Ip).await?;
    let matches: Vec<&AccessRule> = rules.iter().filter(|r| r.subject == ip).collect();
    if let Some(rule) = prefer_whitelist(&matches) {
        return Ok(match rule.list_type {
            ListType::Whitelist => ListDecision::allowed(),
            ListType::Blacklist => ListDecision::blocked(
                rule.note
                    .clone()
                    .unwrap_or_else(|| "IP address blocked".to_string()),
            ),
        });
    }

    if whitelist_mode(shop.to_string(), RuleKind::Ip, db.clone()).await {
        return Ok(ListDecision::blocked("IP address not in whitelist"));
    }
    Ok(ListDecision::allowed())
}

/// Resolve a country code against the shop's country rules. Same shape and
/// default policy as the IP resolver.
pub async fn resolve_country(db: &Database, shop: &str, country: &str) -> Result<ListDecision> {
    let country = country.to_uppercase();

    let rules = db.enabled_rules(shop, RuleKind::Country).await?;
    let matches: Vec<&AccessRule> = rules
        .iter()
        .filter(|r| r.subject.to_uppercase() == country)
        .collect();
    if let Some(rule) = prefer_whitelist(&matches) {
        return Ok(match rule.list_type {
            ListType::Whitelist => ListDecision::allowed(),
            ListType::Blacklist => ListDecision::blocked(
                rule.note
                    .clone()
                    .unwrap_or_else(|| "Country blocked".to_string()),
            ),
        });
    }

    if whitelist_mode(shop.to_string(), RuleKind::Country, db.clone()).await {
        return Ok(ListDecision::blocked("Country not in whitelist"));
    }
    Ok(ListDecision::allowed())
}

//! HTTP route handlers

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use cached::proc_macro::cached;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use super::AppState;
use crate::analytics;
use crate::bots;
use crate::db::{AccessRule, CountryStat, Database, ListType, ReasonStat, RuleKind, VisitSummary};
use crate::decision::{self, Verdict};
use crate::signals::{CheckParams, ClientSignals};

/// Error surface for the admin API. Validation failures never reach the
/// decision path; they are rejected here with a 4xx.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
            ApiError::Internal(e) => {
                tracing::error!("Admin API error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

// === Storefront check ===

#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub session_id: String,
}

/// Categorized block copy, selected by the Bot/IP/Country substring the
/// resolvers guarantee in their reasons.
fn blocked_message(reason: &str) -> &'static str {
    if reason.contains("Bot") {
        "Automated access to this store is not permitted."
    } else if reason.contains("IP") {
        "Access from your network is not permitted."
    } else if reason.contains("Country") {
        "This store is not available in your region."
    } else {
        "Access to this store is restricted."
    }
}

async fn run_check(
    state: &AppState,
    addr: SocketAddr,
    headers: &HeaderMap,
    params: CheckParams,
) -> CheckResponse {
    let signals = ClientSignals::extract(headers, &addr.ip().to_string(), &params);
    let verdict = decision::check_access(&state.db, &state.config.access, &signals).await;

    CheckResponse {
        message: verdict
            .reason
            .as_deref()
            .filter(|_| verdict.blocked)
            .map(|r| blocked_message(r).to_string()),
        blocked: verdict.blocked,
        reason: verdict.reason,
        session_id: verdict.session_id,
    }
}

/// `GET /api/check` - storefront access check with query parameters.
pub async fn check_get(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<CheckParams>,
) -> Json<CheckResponse> {
    Json(run_check(&state, addr, &headers, params).await)
}

/// `POST /api/check` - same check with a JSON body.
pub async fn check_post(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(params): Json<CheckParams>,
) -> Json<CheckResponse> {
    Json(run_check(&state, addr, &headers, params).await)
}

// === Analytics beacon ===

#[derive(Debug, Deserialize)]
pub struct BeaconParams {
    #[serde(flatten)]
    pub check: CheckParams,
    #[serde(default)]
    pub duration: i64,
}

/// `POST /api/beacon` - fire-and-forget visit telemetry. Recording happens
/// in a background task so the response never waits on the datastore.
pub async fn beacon(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(params): Json<BeaconParams>,
) -> impl IntoResponse {
    let signals = ClientSignals::extract(&headers, &addr.ip().to_string(), &params.check);
    let Some(shop) = signals.shop.clone() else {
        return (StatusCode::ACCEPTED, Json(json!({ "ok": true })));
    };

    let m = bots::classify(&signals.user_agent);
    let verdict = Verdict::allow(&signals, m.is_bot, m.name);
    let duration = params.duration;
    let window = state.config.access.session_window_minutes;
    let db = state.db.clone();

    tokio::spawn(async move {
        analytics::record_beacon(&db, window, &shop, &signals, &verdict, duration).await;
    });

    (StatusCode::ACCEPTED, Json(json!({ "ok": true })))
}

// === Admin: rules CRUD ===

#[derive(Debug, Deserialize)]
pub struct ListRulesQuery {
    pub shop: String,
    pub kind: Option<String>,
}

/// `GET /api/admin/rules?shop=&kind=`
pub async fn list_rules(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListRulesQuery>,
) -> Result<Json<Vec<AccessRule>>, ApiError> {
    let kind = parse_optional_kind(query.kind.as_deref())?;
    let rules = state.db.list_rules(&query.shop, kind).await?;
    Ok(Json(rules))
}

#[derive(Debug, Deserialize)]
pub struct CreateRule {
    pub shop: String,
    pub kind: String,
    pub subject: String,
    pub list_type: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub note: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// `POST /api/admin/rules`
pub async fn create_rule(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateRule>,
) -> Result<(StatusCode, Json<AccessRule>), ApiError> {
    if body.shop.trim().is_empty() {
        return Err(ApiError::BadRequest("shop is required".to_string()));
    }
    let kind = RuleKind::parse(&body.kind)
        .ok_or_else(|| ApiError::BadRequest(format!("Unknown rule kind '{}'", body.kind)))?;
    let list_type = ListType::parse(&body.list_type)
        .ok_or_else(|| ApiError::BadRequest(format!("Unknown list_type '{}'", body.list_type)))?;
    let subject = validate_subject(kind, body.subject.trim())?;

    let result = state
        .db
        .create_rule(
            body.shop.trim(),
            kind,
            &subject,
            list_type,
            body.enabled,
            body.note.as_deref(),
        )
        .await;

    let id = match result {
        Ok(id) => id,
        Err(e) if e.to_string().contains("UNIQUE constraint failed") => {
            return Err(ApiError::Conflict(format!(
                "A {} rule for '{}' already exists for this shop",
                kind.as_str(),
                subject
            )));
        }
        Err(e) => return Err(e.into()),
    };

    let rule = state
        .db
        .get_rule(id)
        .await?
        .ok_or_else(|| ApiError::NotFound("rule vanished after insert".to_string()))?;
    Ok((StatusCode::CREATED, Json(rule)))
}

/// Per-kind subject validation. Malformed subjects are rejected here so the
/// decision path only ever sees well-formed rules.
fn validate_subject(kind: RuleKind, subject: &str) -> Result<String, ApiError> {
    if subject.is_empty() {
        return Err(ApiError::BadRequest("subject is required".to_string()));
    }
    match kind {
        RuleKind::Ip => {
            let normalized = crate::signals::normalize_ip(subject);
            normalized
                .parse::<IpAddr>()
                .map_err(|_| ApiError::BadRequest(format!("'{}' is not a valid IP address", subject)))?;
            Ok(normalized)
        }
        RuleKind::Country => {
            if subject.len() != 2 || !subject.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(ApiError::BadRequest(format!(
                    "'{}' is not a two-letter country code",
                    subject
                )));
            }
            Ok(subject.to_uppercase())
        }
        RuleKind::Bot => Ok(subject.to_lowercase()),
    }
}

fn parse_optional_kind(kind: Option<&str>) -> Result<Option<RuleKind>, ApiError> {
    match kind {
        None => Ok(None),
        Some(k) => RuleKind::parse(k)
            .map(Some)
            .ok_or_else(|| ApiError::BadRequest(format!("Unknown rule kind '{}'", k))),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateRule {
    pub enabled: Option<bool>,
    pub list_type: Option<String>,
    pub note: Option<String>,
}

/// `PATCH /api/admin/rules/{id}`
pub async fn update_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateRule>,
) -> Result<Json<AccessRule>, ApiError> {
    let list_type = match body.list_type.as_deref() {
        None => None,
        Some(t) => Some(
            ListType::parse(t)
                .ok_or_else(|| ApiError::BadRequest(format!("Unknown list_type '{}'", t)))?,
        ),
    };

    let updated = state
        .db
        .update_rule(id, body.enabled, list_type, body.note.as_deref())
        .await?;
    if !updated {
        return Err(ApiError::NotFound(format!("No rule with id {}", id)));
    }
    let rule = state
        .db
        .get_rule(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No rule with id {}", id)))?;
    Ok(Json(rule))
}

/// `DELETE /api/admin/rules/{id}`
pub async fn delete_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if state.db.delete_rule(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("No rule with id {}", id)))
    }
}

// === Admin: stats and uninstall ===

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub shop: String,
    #[serde(default = "default_hours")]
    pub hours: i64,
}

fn default_hours() -> i64 {
    24
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub total_visits: i64,
    pub unique_visitors: i64,
    pub blocked: i64,
    pub bots: i64,
    pub countries: Vec<CountryStat>,
    pub blocked_reasons: Vec<ReasonStat>,
}

/// Cached stats query - 60 second TTL
#[cached(time = 60, key = "String", convert = r#"{ format!("{}:{}", shop, hours) }"#)]
async fn get_cached_stats(shop: String, hours: i64, db: Database) -> StatsResponse {
    let (total, unique, blocked, bots, countries, reasons) = tokio::join!(
        db.get_visit_count(&shop, hours),
        db.get_unique_visitors(&shop, hours),
        db.get_blocked_count(&shop, hours),
        db.get_bot_count(&shop, hours),
        db.get_country_stats(&shop, hours),
        db.get_blocked_reason_stats(&shop, hours, 20)
    );

    StatsResponse {
        total_visits: total.unwrap_or(0),
        unique_visitors: unique.unwrap_or(0),
        blocked: blocked.unwrap_or(0),
        bots: bots.unwrap_or(0),
        countries: countries.unwrap_or_default(),
        blocked_reasons: reasons.unwrap_or_default(),
    }
}

/// `GET /api/admin/stats?shop=&hours=` (cached for 60 seconds)
pub async fn shop_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> Json<StatsResponse> {
    Json(get_cached_stats(query.shop, query.hours, state.db.clone()).await)
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub shop: String,
    #[serde(default = "default_limit")]
    pub limit: i32,
}

fn default_limit() -> i32 {
    50
}

/// `GET /api/admin/recent?shop=` - latest visit rows, uncached.
pub async fn recent_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Vec<VisitSummary>>, ApiError> {
    let rows = state
        .db
        .get_recent_sessions(&query.shop, query.limit.clamp(1, 500))
        .await?;
    Ok(Json(rows))
}

/// `DELETE /api/admin/shops/{shop}` - uninstall purge of rules and visits.
pub async fn purge_shop(
    State(state): State<Arc<AppState>>,
    Path(shop): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (rules, sessions) = state.db.delete_shop_data(&shop).await?;
    tracing::info!("Purged shop {}: {} rules, {} sessions", shop, rules, sessions);
    Ok(Json(json!({ "rules_deleted": rules, "sessions_deleted": sessions })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_validation_rejects_malformed_input() {
        assert!(validate_subject(RuleKind::Ip, "not-an-ip").is_err());
        assert!(validate_subject(RuleKind::Ip, "203.0.113.5").is_ok());
        assert_eq!(
            validate_subject(RuleKind::Ip, "::ffff:203.0.113.5").unwrap(),
            "203.0.113.5"
        );
        assert!(validate_subject(RuleKind::Country, "USA").is_err());
        assert!(validate_subject(RuleKind::Country, "u1").is_err());
        assert_eq!(validate_subject(RuleKind::Country, "us").unwrap(), "US");
        assert_eq!(validate_subject(RuleKind::Bot, "GoogleBot").unwrap(), "googlebot");
        assert!(validate_subject(RuleKind::Bot, "").is_err());
    }

    #[test]
    fn blocked_message_is_categorized() {
        assert!(blocked_message("Unknown Bot - not whitelisted").contains("Automated"));
        assert!(blocked_message("IP address blocked").contains("network"));
        assert!(blocked_message("Country not in whitelist").contains("region"));
        assert!(blocked_message("banned for scraping").contains("restricted"));
    }
}

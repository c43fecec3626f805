//! Visit analytics recording
//!
//! Upserts a session-scoped visit row: repeat requests with the same
//! session id inside the window merge into one row with incremented
//! counters. Recording runs for every request, blocked or not, and a
//! recording failure never alters the access verdict.

use chrono::{Duration, Utc};

use crate::db::{Database, NewVisit};
use crate::decision::Verdict;
use crate::signals::ClientSignals;

/// Record one request against the session window. Errors are logged and
/// swallowed; this function never fails past its boundary.
pub async fn record(
    db: &Database,
    window_minutes: i64,
    shop: &str,
    signals: &ClientSignals,
    verdict: &Verdict,
) {
    if let Err(e) = record_inner(db, window_minutes, shop, signals, verdict, None).await {
        tracing::warn!("Failed to record visit for {}: {}", shop, e);
    }
}

/// Beacon path: same upsert, with a client-supplied duration.
pub async fn record_beacon(
    db: &Database,
    window_minutes: i64,
    shop: &str,
    signals: &ClientSignals,
    verdict: &Verdict,
    duration_secs: i64,
) {
    if let Err(e) = record_inner(db, window_minutes, shop, signals, verdict, Some(duration_secs)).await
    {
        tracing::warn!("Failed to record beacon for {}: {}", shop, e);
    }
}

async fn record_inner(
    db: &Database,
    window_minutes: i64,
    shop: &str,
    signals: &ClientSignals,
    verdict: &Verdict,
    duration_secs: Option<i64>,
) -> anyhow::Result<()> {
    let cutoff = (Utc::now() - Duration::minutes(window_minutes)).timestamp_millis();

    match db
        .find_recent_session(shop, &signals.session_id, cutoff)
        .await?
    {
        // A beacon is not a page view: it only refreshes the duration. A
        // page-view merge must not clobber a beacon-recorded duration.
        Some(id) => match duration_secs {
            Some(duration) => db.update_session_duration(id, duration).await?,
            None => db.touch_session(id, &signals.page_url).await?,
        },
        None => {
            let (browser_name, browser_version) = crate::signals::browser(&signals.user_agent);
            db.insert_session(&NewVisit {
                shop: shop.to_string(),
                session_id: signals.session_id.clone(),
                ip_address: signals.ip.clone(),
                country_code: signals.country_code.clone(),
                user_agent: signals.user_agent.clone(),
                device_type: crate::signals::device_type(&signals.user_agent).to_string(),
                browser_name: browser_name.to_string(),
                browser_version,
                page_url: signals.page_url.clone(),
                referrer: signals.referrer.clone(),
                visit_duration: duration_secs.unwrap_or(0),
                is_bot: verdict.is_bot,
                bot_name: verdict.bot_name.clone(),
                blocked_reason: verdict.reason.clone(),
            })
            .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    fn signals(session_id: &str, page: &str) -> ClientSignals {
        ClientSignals {
            ip: "203.0.113.1".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0) Chrome/120.0.0.0 Safari/537.36".to_string(),
            shop: Some("merge.example".to_string()),
            country_code: Some("US".to_string()),
            page_url: page.to_string(),
            referrer: None,
            session_id: session_id.to_string(),
        }
    }

    fn allowed_verdict(signals: &ClientSignals) -> Verdict {
        Verdict::allow(signals, false, None)
    }

    #[tokio::test]
    async fn repeat_requests_merge_into_one_row() {
        let db = test_db().await;
        let s = signals("sess-merge", "/products/a");
        let v = allowed_verdict(&s);

        record(&db, 30, "merge.example", &s, &v).await;
        let s2 = signals("sess-merge", "/products/b");
        record(&db, 30, "merge.example", &s2, &v).await;

        let rows = db.get_recent_sessions("merge.example", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].page_views, 2);
        assert_eq!(rows[0].page_url, "/products/b");
    }

    #[tokio::test]
    async fn expired_window_starts_a_new_row() {
        let db = test_db().await;
        let s = signals("sess-expire", "/");
        let v = allowed_verdict(&s);

        record(&db, 30, "merge.example", &s, &v).await;

        // Backdate the row past the window
        let old = (Utc::now() - Duration::minutes(45)).timestamp_millis();
        sqlx::query("UPDATE visit_sessions SET created_at = ? WHERE session_id = ?")
            .bind(old)
            .bind("sess-expire")
            .execute(db.pool())
            .await
            .unwrap();

        record(&db, 30, "merge.example", &s, &v).await;

        let rows = db.get_recent_sessions("merge.example", 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.page_views == 1));
    }

    #[tokio::test]
    async fn blocked_reason_is_captured_on_insert() {
        let db = test_db().await;
        let s = signals("sess-blocked", "/");
        let v = Verdict::block(&s, "IP address blocked", false, None);

        record(&db, 30, "merge.example", &s, &v).await;

        let rows = db.get_recent_sessions("merge.example", 10).await.unwrap();
        assert_eq!(rows[0].blocked_reason.as_deref(), Some("IP address blocked"));
    }

    #[tokio::test]
    async fn beacon_updates_duration_without_counting_a_page_view() {
        let db = test_db().await;
        let s = signals("sess-beacon", "/");
        let v = allowed_verdict(&s);

        record(&db, 30, "merge.example", &s, &v).await;
        record_beacon(&db, 30, "merge.example", &s, &v, 42).await;

        let rows = db.get_recent_sessions("merge.example", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].visit_duration, 42);
        assert_eq!(rows[0].page_views, 1);
    }

    #[tokio::test]
    async fn page_view_merge_keeps_the_beacon_duration() {
        let db = test_db().await;
        let s = signals("sess-keep", "/products/a");
        let v = allowed_verdict(&s);

        record(&db, 30, "merge.example", &s, &v).await;
        record_beacon(&db, 30, "merge.example", &s, &v, 42).await;
        let s2 = signals("sess-keep", "/products/b");
        record(&db, 30, "merge.example", &s2, &v).await;

        let rows = db.get_recent_sessions("merge.example", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].page_views, 2);
        assert_eq!(rows[0].visit_duration, 42);
        assert_eq!(rows[0].page_url, "/products/b");
    }

    #[tokio::test]
    async fn beacon_without_prior_visit_inserts_with_its_duration() {
        let db = test_db().await;
        let s = signals("sess-fresh", "/");
        let v = allowed_verdict(&s);

        record_beacon(&db, 30, "merge.example", &s, &v, 17).await;

        let rows = db.get_recent_sessions("merge.example", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].visit_duration, 17);
        assert_eq!(rows[0].page_views, 1);
    }
}

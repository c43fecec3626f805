//! Database schema definitions

pub const CREATE_RULES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS access_rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    shop TEXT NOT NULL,
    kind TEXT NOT NULL,
    subject TEXT NOT NULL,
    list_type TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    note TEXT,
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL,
    UNIQUE(shop, kind, subject)
)
"#;

pub const CREATE_SESSIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS visit_sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    shop TEXT NOT NULL,
    session_id TEXT NOT NULL,
    ip_address TEXT NOT NULL,
    country_code TEXT,
    user_agent TEXT NOT NULL,
    device_type TEXT NOT NULL,
    browser_name TEXT NOT NULL,
    browser_version TEXT NOT NULL,
    page_url TEXT NOT NULL,
    referrer TEXT,
    visit_duration INTEGER NOT NULL DEFAULT 0,
    page_views INTEGER NOT NULL DEFAULT 1,
    is_bot INTEGER NOT NULL DEFAULT 0,
    bot_name TEXT,
    blocked_reason TEXT,
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL
)
"#;

// Rule lookups always filter by shop + kind (+ enabled)
pub const CREATE_INDEX_RULES_SHOP_KIND: &str =
    "CREATE INDEX IF NOT EXISTS idx_rules_shop_kind ON access_rules(shop, kind, enabled)";

// Session upsert: most recent row for (shop, session_id)
pub const CREATE_INDEX_SESSIONS_LOOKUP: &str =
    "CREATE INDEX IF NOT EXISTS idx_sessions_lookup ON visit_sessions(shop, session_id, created_at DESC)";

// For time-ranged stats queries per shop
pub const CREATE_INDEX_SESSIONS_SHOP_TS: &str =
    "CREATE INDEX IF NOT EXISTS idx_sessions_shop_ts ON visit_sessions(shop, created_at)";

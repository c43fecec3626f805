//! Bot classification from the user-agent string
//!
//! Pure pattern matching against a static signature table, with suspicion
//! heuristics for UAs that match nothing. No I/O, no side effects.

use regex::Regex;
use std::sync::LazyLock;

/// Result of classifying a user agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotMatch {
    pub is_bot: bool,
    pub name: Option<String>,
}

impl BotMatch {
    fn human() -> Self {
        Self {
            is_bot: false,
            name: None,
        }
    }

    fn bot(name: &str) -> Self {
        Self {
            is_bot: true,
            name: Some(name.to_string()),
        }
    }
}

/// Known bot signatures, in priority order. Specific names come first so
/// "Googlebot/2.1" resolves to "Googlebot" rather than the generic "bot"
/// entry at the bottom.
static BOT_SIGNATURES: &[(&str, &str)] = &[
    // Search engines
    ("googlebot", "Googlebot"),
    ("bingbot", "Bingbot"),
    ("slurp", "Yahoo Slurp"),
    ("duckduckbot", "DuckDuckBot"),
    ("baiduspider", "Baiduspider"),
    ("yandexbot", "YandexBot"),
    ("applebot", "Applebot"),
    // Social media crawlers
    ("facebookexternalhit", "Facebook Crawler"),
    ("facebot", "Facebook Crawler"),
    ("twitterbot", "Twitterbot"),
    ("linkedinbot", "LinkedInBot"),
    ("pinterestbot", "PinterestBot"),
    ("whatsapp", "WhatsApp"),
    ("telegrambot", "TelegramBot"),
    ("discordbot", "Discordbot"),
    // SEO and marketing tools
    ("ahrefsbot", "AhrefsBot"),
    ("semrushbot", "SemrushBot"),
    ("mj12bot", "MJ12bot"),
    ("dotbot", "DotBot"),
    ("rogerbot", "Rogerbot"),
    ("screaming frog", "Screaming Frog"),
    // Monitoring
    ("uptimerobot", "UptimeRobot"),
    ("pingdom", "Pingdom"),
    ("statuscake", "StatusCake"),
    ("site24x7", "Site24x7"),
    // HTTP clients and scripting tools
    ("curl", "curl"),
    ("wget", "Wget"),
    ("python-requests", "Python Requests"),
    ("python-urllib", "Python urllib"),
    ("go-http-client", "Go HTTP Client"),
    ("java/", "Java Client"),
    ("okhttp", "OkHttp"),
    ("axios", "Axios"),
    ("node-fetch", "Node Fetch"),
    ("httpie", "HTTPie"),
    // Generic terms last: a specific name above must win on overlap
    ("crawler", "Generic Crawler"),
    ("spider", "Generic Spider"),
    ("scraper", "Generic Scraper"),
    ("bot", "Generic Bot"),
];

/// Matches a bare "name/1.2.3" UA with no browser platform decoration.
static BARE_TOOL_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_.-]+/[0-9][0-9a-z.-]*$").expect("valid regex"));

const SUSPICIOUS_KEYWORDS: &[&str] = &["headless", "phantom", "selenium", "automation", "test"];

/// Classify a user-agent string. First signature match wins; UAs matching
/// nothing are screened by suspicion heuristics before being called human.
pub fn classify(user_agent: &str) -> BotMatch {
    let ua = user_agent.trim().to_lowercase();

    if ua.is_empty() {
        return BotMatch::bot("Suspicious Bot");
    }

    for (pattern, name) in BOT_SIGNATURES {
        if ua.contains(pattern) {
            return BotMatch::bot(name);
        }
    }

    if BARE_TOOL_SHAPE.is_match(&ua) {
        return BotMatch::bot("Suspicious Bot");
    }
    if SUSPICIOUS_KEYWORDS.iter().any(|k| ua.contains(k)) {
        return BotMatch::bot("Suspicious Bot");
    }

    BotMatch::human()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specific_name_beats_generic() {
        let m = classify("Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)");
        assert!(m.is_bot);
        assert_eq!(m.name.as_deref(), Some("Googlebot"));

        let m = classify("Mozilla/5.0 (compatible; bingbot/2.0)");
        assert_eq!(m.name.as_deref(), Some("Bingbot"));
    }

    #[test]
    fn generic_terms_still_match() {
        let m = classify("SomeRandomBot/3.4");
        assert!(m.is_bot);
        assert_eq!(m.name.as_deref(), Some("Generic Bot"));

        let m = classify("WebSpider 1.0");
        assert_eq!(m.name.as_deref(), Some("Generic Spider"));
    }

    #[test]
    fn http_clients_are_bots() {
        assert_eq!(classify("curl/7.88.0").name.as_deref(), Some("curl"));
        assert_eq!(
            classify("python-requests/2.31.0").name.as_deref(),
            Some("Python Requests")
        );
        assert_eq!(classify("Wget/1.21").name.as_deref(), Some("Wget"));
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert_eq!(classify("GOOGLEBOT/2.1").name.as_deref(), Some("Googlebot"));
        assert_eq!(classify("CURL/8.0").name.as_deref(), Some("curl"));
    }

    #[test]
    fn empty_ua_is_suspicious() {
        let m = classify("");
        assert!(m.is_bot);
        assert_eq!(m.name.as_deref(), Some("Suspicious Bot"));
        assert!(classify("   ").is_bot);
    }

    #[test]
    fn bare_tool_shape_is_suspicious() {
        let m = classify("myfetcher/1.0");
        assert!(m.is_bot);
        assert_eq!(m.name.as_deref(), Some("Suspicious Bot"));
    }

    #[test]
    fn headless_keywords_are_suspicious() {
        let m = classify("Mozilla/5.0 (X11; Linux x86_64) HeadlessChrome/120.0");
        assert!(m.is_bot);
        assert_eq!(m.name.as_deref(), Some("Suspicious Bot"));
    }

    #[test]
    fn normal_browsers_are_human() {
        let ua = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                  (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
        let m = classify(ua);
        assert!(!m.is_bot);
        assert_eq!(m.name, None);

        let ua = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 \
                  (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1";
        assert!(!classify(ua).is_bot);
    }
}

//! Client signal extraction
//!
//! Derives the raw inputs of an access decision from an inbound request:
//! client IP (proxy-header aware), user agent, declared shop, and country
//! hint. Country comes from an explicit parameter or the CF-IPCountry edge
//! header only; it is exactly as trustworthy as the CDN or the client, and
//! the gate deliberately does no server-side geolocation.

use axum::http::HeaderMap;
use std::net::IpAddr;

/// Everything the decision pipeline needs about one request.
#[derive(Debug, Clone)]
pub struct ClientSignals {
    pub ip: String,
    pub user_agent: String,
    pub shop: Option<String>,
    pub country_code: Option<String>,
    pub page_url: String,
    pub referrer: Option<String>,
    pub session_id: String,
}

/// Request parameters the storefront script sends alongside the headers.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct CheckParams {
    pub shop: Option<String>,
    pub session_id: Option<String>,
    pub country: Option<String>,
    pub page_url: Option<String>,
    pub referrer: Option<String>,
}

impl ClientSignals {
    pub fn extract(headers: &HeaderMap, peer_ip: &str, params: &CheckParams) -> Self {
        let ip = client_ip(headers, peer_ip);
        let user_agent = header_str(headers, "user-agent").unwrap_or_default();
        let country_code = params
            .country
            .as_deref()
            .or_else(|| header_str(headers, "cf-ipcountry"))
            .map(|c| c.trim().to_uppercase())
            .filter(|c| !c.is_empty() && c != "XX");

        Self {
            ip,
            user_agent: user_agent.to_string(),
            shop: params.shop.clone().filter(|s| !s.is_empty()),
            country_code,
            page_url: params.page_url.clone().unwrap_or_else(|| "/".to_string()),
            referrer: params.referrer.clone().filter(|r| !r.is_empty()),
            session_id: params
                .session_id
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
}

/// Get the real client IP address, checking proxy headers first
/// Priority: X-Forwarded-For (first IP) > X-Real-IP > CF-Connecting-IP > peer
pub fn client_ip(headers: &HeaderMap, peer_ip: &str) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for") {
        if let Ok(ips) = forwarded.to_str() {
            if let Some(first_ip) = ips.split(',').next() {
                let ip = first_ip.trim();
                if !ip.is_empty() {
                    return normalize_ip(ip);
                }
            }
        }
    }

    if let Some(real_ip) = header_str(headers, "x-real-ip") {
        return normalize_ip(real_ip);
    }

    if let Some(cf_ip) = header_str(headers, "cf-connecting-ip") {
        return normalize_ip(cf_ip);
    }

    normalize_ip(peer_ip)
}

/// Strip the IPv6-mapped-IPv4 prefix so dual-stack addresses compare equal
/// to their IPv4 form.
pub fn normalize_ip(ip: &str) -> String {
    ip.strip_prefix("::ffff:").unwrap_or(ip).to_string()
}

/// Check if an IP address is private/local
pub fn is_private_ip(ip: &str) -> bool {
    let Ok(addr) = normalize_ip(ip).parse::<IpAddr>() else {
        return false;
    };
    match addr {
        IpAddr::V4(ipv4) => {
            ipv4.is_private()
                || ipv4.is_loopback()
                || ipv4.is_link_local()
                || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => ipv6.is_loopback() || ipv6.is_unspecified(),
    }
}

/// Coarse device class from the user agent.
pub fn device_type(user_agent: &str) -> &'static str {
    let ua = user_agent.to_lowercase();
    if ua.contains("ipad") || ua.contains("tablet") {
        "tablet"
    } else if ua.contains("mobile") || ua.contains("iphone") || ua.contains("android") {
        "mobile"
    } else {
        "desktop"
    }
}

/// Browser name and major version from the user agent.
///
/// Order matters: Edge and Opera embed "Chrome", Chrome embeds "Safari".
pub fn browser(user_agent: &str) -> (&'static str, String) {
    const BROWSERS: &[(&str, &str)] = &[
        ("edg/", "Edge"),
        ("edge/", "Edge"),
        ("opr/", "Opera"),
        ("opera", "Opera"),
        ("firefox/", "Firefox"),
        ("chrome/", "Chrome"),
        ("safari/", "Safari"),
        ("msie", "Internet Explorer"),
        ("trident", "Internet Explorer"),
    ];

    let ua = user_agent.to_lowercase();
    for (token, name) in BROWSERS {
        if let Some(idx) = ua.find(token) {
            let version = if token.ends_with('/') {
                let rest = &ua[idx + token.len()..];
                let end = rest
                    .find(|c: char| !c.is_ascii_digit() && c != '.')
                    .unwrap_or(rest.len());
                rest[..end].to_string()
            } else {
                String::new()
            };
            // Safari reports its engine version after "safari/"; the real
            // version lives behind "version/".
            if *name == "Safari" {
                if let Some(v) = extract_after(&ua, "version/") {
                    return ("Safari", v);
                }
            }
            return (name, version);
        }
    }
    ("Unknown", String::new())
}

fn extract_after(ua: &str, prefix: &str) -> Option<String> {
    let idx = ua.find(prefix)?;
    let rest = &ua[idx + prefix.len()..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(rest.len());
    if end == 0 {
        None
    } else {
        Some(rest[..end].to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn forwarded_for_wins_over_real_ip() {
        let h = headers(&[
            ("x-forwarded-for", "203.0.113.1, 10.0.0.1"),
            ("x-real-ip", "198.51.100.2"),
        ]);
        assert_eq!(client_ip(&h, "127.0.0.1"), "203.0.113.1");
    }

    #[test]
    fn real_ip_wins_over_cf() {
        let h = headers(&[
            ("x-real-ip", "198.51.100.2"),
            ("cf-connecting-ip", "192.0.2.3"),
        ]);
        assert_eq!(client_ip(&h, "127.0.0.1"), "198.51.100.2");
    }

    #[test]
    fn falls_back_to_peer_address() {
        let h = HeaderMap::new();
        assert_eq!(client_ip(&h, "192.0.2.44"), "192.0.2.44");
    }

    #[test]
    fn mapped_ipv4_is_normalized() {
        let h = headers(&[("x-forwarded-for", "::ffff:203.0.113.1")]);
        assert_eq!(client_ip(&h, "127.0.0.1"), "203.0.113.1");
        assert_eq!(normalize_ip("::ffff:127.0.0.1"), "127.0.0.1");
        assert_eq!(normalize_ip("2001:db8::1"), "2001:db8::1");
    }

    #[test]
    fn private_ip_detection() {
        assert!(is_private_ip("127.0.0.1"));
        assert!(is_private_ip("10.1.2.3"));
        assert!(is_private_ip("192.168.0.10"));
        assert!(is_private_ip("::ffff:192.168.0.10"));
        assert!(!is_private_ip("203.0.113.5"));
        assert!(!is_private_ip("not-an-ip"));
    }

    #[test]
    fn country_prefers_param_over_header() {
        let h = headers(&[("cf-ipcountry", "DE")]);
        let params = CheckParams {
            shop: Some("s1.myshopify.com".to_string()),
            country: Some("fr".to_string()),
            ..Default::default()
        };
        let signals = ClientSignals::extract(&h, "203.0.113.1", &params);
        assert_eq!(signals.country_code.as_deref(), Some("FR"));

        let signals = ClientSignals::extract(&h, "203.0.113.1", &CheckParams::default());
        assert_eq!(signals.country_code.as_deref(), Some("DE"));
    }

    #[test]
    fn unknown_cf_country_is_dropped() {
        let h = headers(&[("cf-ipcountry", "XX")]);
        let signals = ClientSignals::extract(&h, "203.0.113.1", &CheckParams::default());
        assert_eq!(signals.country_code, None);
    }

    #[test]
    fn missing_session_id_gets_generated() {
        let signals =
            ClientSignals::extract(&HeaderMap::new(), "203.0.113.1", &CheckParams::default());
        assert!(!signals.session_id.is_empty());
    }

    #[test]
    fn device_classes() {
        assert_eq!(device_type("Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X)"), "mobile");
        assert_eq!(device_type("Mozilla/5.0 (iPad; CPU OS 16_0)"), "tablet");
        assert_eq!(device_type("Mozilla/5.0 (Windows NT 10.0; Win64; x64)"), "desktop");
    }

    #[test]
    fn browser_order_sensitive_matching() {
        let (name, version) = browser(
            "Mozilla/5.0 (Windows NT 10.0) AppleWebKit/537.36 Chrome/120.0.0.0 Safari/537.36 Edg/120.0.2210.91",
        );
        assert_eq!(name, "Edge");
        assert!(version.starts_with("120"));

        let (name, _) = browser(
            "Mozilla/5.0 (Windows NT 10.0) AppleWebKit/537.36 Chrome/120.0.0.0 Safari/537.36",
        );
        assert_eq!(name, "Chrome");

        let (name, version) = browser(
            "Mozilla/5.0 (Macintosh) AppleWebKit/605.1.15 Version/17.1 Safari/605.1.15",
        );
        assert_eq!(name, "Safari");
        assert_eq!(version, "17.1");
    }
}

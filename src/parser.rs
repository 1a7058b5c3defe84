//! Access-log line parsing
//!
//! One raw line in, one `ParsedLogEntry` out. The combined format is scanned
//! manually (delimiters are fixed: spaces, brackets, quotes), which avoids a
//! regex engine on the hot path. The JSON format is decoded permissively:
//! each logical field is looked up through a list of aliases so the common
//! nginx/ingress JSON layouts all map onto the same entry.

use chrono::{DateTime, Local, LocalResult, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::ParseError;
use crate::geoip::is_private_ip;

/// Log line layout of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Combined,
    Json,
    /// Reserved for user-supplied formats; parsed as combined for now.
    Custom,
}

impl LogFormat {
    pub fn from_name(name: &str) -> Self {
        match name {
            "json" => LogFormat::Json,
            "custom" => LogFormat::Custom,
            _ => LogFormat::Combined,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Combined => "combined",
            LogFormat::Json => "json",
            LogFormat::Custom => "custom",
        }
    }
}

/// One successfully parsed request line.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLogEntry {
    pub timestamp: DateTime<Utc>,
    pub remote_addr: String,
    pub remote_user: String,
    pub method: String,
    pub uri: String,
    pub protocol: String,
    pub status: i64,
    pub body_bytes: i64,
    pub referer: String,
    pub user_agent: String,
    pub request_time: f64,
    pub upstream_time: f64,
    pub host: String,
}

impl Default for ParsedLogEntry {
    fn default() -> Self {
        Self {
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            remote_addr: String::new(),
            remote_user: String::new(),
            method: String::new(),
            uri: String::new(),
            protocol: String::new(),
            status: 0,
            body_bytes: 0,
            referer: String::new(),
            user_agent: String::new(),
            request_time: 0.0,
            upstream_time: 0.0,
            host: String::new(),
        }
    }
}

/// Parse one line in the given format.
pub fn parse_line(line: &str, format: LogFormat) -> Result<ParsedLogEntry, ParseError> {
    match format {
        LogFormat::Json => parse_json(line),
        LogFormat::Combined | LogFormat::Custom => parse_combined(line),
    }
}

// ---------------------------------------------------------------------------
// combined format
// ---------------------------------------------------------------------------

/// `$remote_addr - $remote_user [$time_local] "$request" $status
/// $body_bytes_sent "$http_referer" "$http_user_agent"` with optional
/// trailing `$request_time $upstream_response_time $host` tokens.
fn parse_combined(line: &str) -> Result<ParsedLogEntry, ParseError> {
    let (remote_addr, rest) = token(line)?;
    let (dash, rest) = token(rest)?;
    if dash != "-" {
        return Err(ParseError::Malformed);
    }
    let (user, rest) = token(rest)?;

    let rest = rest.trim_start();
    let rest = rest.strip_prefix('[').ok_or(ParseError::Malformed)?;
    let end = rest.find(']').ok_or(ParseError::Malformed)?;
    let time_str = &rest[..end];
    let rest = &rest[end + 1..];

    let (request, rest) = quoted(rest)?;
    let (status_tok, rest) = token(rest)?;
    let (bytes_tok, rest) = token(rest)?;
    let (referer, rest) = quoted(rest)?;
    let (user_agent, rest) = quoted(rest)?;

    let mut entry = ParsedLogEntry {
        timestamp: parse_local_timestamp(time_str)?,
        remote_addr: remote_addr.to_string(),
        remote_user: dashless(user),
        // Garbage status/bytes tokens zero the field, never the line
        status: status_tok.parse().unwrap_or(0),
        body_bytes: bytes_tok.parse().unwrap_or(0),
        referer: dashless(referer),
        user_agent: dashless(user_agent),
        ..Default::default()
    };

    let (method, uri, protocol) = split_request(request);
    entry.method = method;
    entry.uri = uri;
    entry.protocol = protocol;

    // Optional nginx `main`-style suffix
    let mut tail = rest.split_whitespace();
    entry.request_time = tail.next().map(parse_seconds).unwrap_or(0.0);
    entry.upstream_time = tail.next().map(parse_seconds).unwrap_or(0.0);
    entry.host = tail
        .next()
        .filter(|t| *t != "-")
        .unwrap_or("")
        .to_string();

    if entry.host.is_empty() {
        entry.host = referer_domain(&entry.referer);
    }

    Ok(entry)
}

fn token(s: &str) -> Result<(&str, &str), ParseError> {
    let s = s.trim_start();
    if s.is_empty() {
        return Err(ParseError::Malformed);
    }
    match s.find(' ') {
        Some(i) => Ok((&s[..i], &s[i + 1..])),
        None => Ok((s, "")),
    }
}

fn quoted(s: &str) -> Result<(&str, &str), ParseError> {
    let s = s.trim_start();
    let s = s.strip_prefix('"').ok_or(ParseError::Malformed)?;
    let end = s.find('"').ok_or(ParseError::Malformed)?;
    Ok((&s[..end], &s[end + 1..]))
}

fn dashless(s: &str) -> String {
    if s == "-" {
        String::new()
    } else {
        s.to_string()
    }
}

fn split_request(request: &str) -> (String, String, String) {
    let mut parts = request.splitn(3, ' ');
    let method = parts.next().unwrap_or("").to_string();
    let uri = parts.next().unwrap_or("").to_string();
    let protocol = parts.next().unwrap_or("").to_string();
    (method, uri, protocol)
}

/// `$request_time`-style token: seconds with millisecond precision, `-` when
/// absent. Multi-upstream lists ("0.004, 0.008") take the first value.
fn parse_seconds(tok: &str) -> f64 {
    let first = tok.split(',').next().unwrap_or(tok).trim();
    if first == "-" {
        return 0.0;
    }
    first.parse().unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// timestamps
// ---------------------------------------------------------------------------

/// `[$time_local]` grammar: explicit UTC offset first, then the server's
/// local timezone (nginx's default local-time format carries no offset).
fn parse_local_timestamp(s: &str) -> Result<DateTime<Utc>, ParseError> {
    if let Ok(t) = DateTime::parse_from_str(s, "%d/%b/%Y:%H:%M:%S %z") {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%d/%b/%Y:%H:%M:%S") {
        return local_to_utc(naive).ok_or_else(|| ParseError::Timestamp(s.to_string()));
    }
    Err(ParseError::Timestamp(s.to_string()))
}

/// Timestamp grammar for JSON logs: the combined grammar plus RFC 3339 and
/// the common `YYYY-MM-DD` variants.
fn parse_any_timestamp(s: &str) -> Result<DateTime<Utc>, ParseError> {
    if let Ok(t) = parse_local_timestamp(s) {
        return Ok(t);
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return local_to_utc(naive).ok_or_else(|| ParseError::Timestamp(s.to_string()));
        }
    }
    Err(ParseError::Timestamp(s.to_string()))
}

fn local_to_utc(naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    match Local.from_local_datetime(&naive) {
        LocalResult::Single(t) => Some(t.with_timezone(&Utc)),
        LocalResult::Ambiguous(t, _) => Some(t.with_timezone(&Utc)),
        LocalResult::None => None,
    }
}

// ---------------------------------------------------------------------------
// json format
// ---------------------------------------------------------------------------

fn parse_json(line: &str) -> Result<ParsedLogEntry, ParseError> {
    let value: Value = serde_json::from_str(line)?;
    let obj = value.as_object().ok_or(ParseError::Malformed)?;

    let str_alias = |keys: &[&str]| -> String {
        for k in keys {
            if let Some(s) = obj.get(*k).and_then(Value::as_str) {
                if !s.is_empty() && s != "-" {
                    return s.to_string();
                }
            }
        }
        String::new()
    };
    // Numeric fields may arrive as JSON numbers or quoted strings
    let int_alias = |keys: &[&str]| -> i64 {
        for k in keys {
            match obj.get(*k) {
                Some(Value::Number(n)) => {
                    if let Some(v) = n.as_i64() {
                        if v != 0 {
                            return v;
                        }
                    }
                }
                Some(Value::String(s)) => {
                    if let Ok(v) = s.trim().parse::<i64>() {
                        if v != 0 {
                            return v;
                        }
                    }
                }
                _ => {}
            }
        }
        0
    };
    let float_alias = |keys: &[&str]| -> f64 {
        for k in keys {
            match obj.get(*k) {
                Some(Value::Number(n)) => {
                    if let Some(v) = n.as_f64() {
                        if v != 0.0 {
                            return v;
                        }
                    }
                }
                Some(Value::String(s)) => {
                    let v = parse_seconds(s);
                    if v != 0.0 {
                        return v;
                    }
                }
                _ => {}
            }
        }
        0.0
    };

    let time_str = str_alias(&["time_local", "time", "@timestamp"]);
    if time_str.is_empty() {
        return Err(ParseError::Timestamp(String::new()));
    }

    let mut entry = ParsedLogEntry {
        timestamp: parse_any_timestamp(&time_str)?,
        remote_addr: str_alias(&["remote_addr", "client_ip"]),
        remote_user: str_alias(&["remote_user"]),
        status: int_alias(&["status", "status_code"]),
        body_bytes: int_alias(&["body_bytes_sent", "bytes", "bytes_sent"]),
        referer: str_alias(&["http_referer", "referer"]),
        user_agent: str_alias(&["http_user_agent", "user_agent"]),
        request_time: float_alias(&["request_time"]),
        upstream_time: float_alias(&["upstream_response_time", "upstream_time"]),
        host: str_alias(&["host", "server_name"]),
        ..Default::default()
    };

    // Behind a load balancer the direct address is private; the real client
    // is the first hop of X-Forwarded-For.
    let direct_is_private = entry
        .remote_addr
        .parse()
        .map(|ip| is_private_ip(&ip))
        .unwrap_or(false);
    if entry.remote_addr.is_empty() || direct_is_private {
        let xff = str_alias(&["x_forwarded_for", "x_forwarded"]);
        if let Some(first) = xff.split(',').next() {
            let first = first.trim();
            if !first.is_empty() && first != "-" {
                entry.remote_addr = first.to_string();
            }
        }
    }

    entry.method = str_alias(&["request_method"]);
    entry.uri = str_alias(&["request_uri", "uri"]);
    entry.protocol = str_alias(&["server_protocol", "protocol"]);
    if entry.method.is_empty() {
        let request = str_alias(&["request"]);
        if !request.is_empty() {
            let (method, uri, protocol) = split_request(&request);
            entry.method = method;
            entry.uri = uri;
            entry.protocol = protocol;
        }
    }

    if entry.host.is_empty() {
        entry.host = referer_domain(&entry.referer);
    }

    Ok(entry)
}

// ---------------------------------------------------------------------------
// derived attributes
// ---------------------------------------------------------------------------

/// SHA-256 hex digest used as dimension business key for long strings.
pub fn hash_key(s: &str) -> String {
    hex::encode(Sha256::digest(s.as_bytes()))
}

/// Strip query string and fragment from a URI.
pub fn normalize_url(uri: &str) -> String {
    let end = uri.find(|c| c == '?' || c == '#').unwrap_or(uri.len());
    uri[..end].to_string()
}

/// Host part of a referer URL ("" when absent or unparseable).
pub fn referer_domain(referer: &str) -> String {
    if referer.is_empty() || referer == "-" {
        return String::new();
    }
    let rest = match referer.find("://") {
        Some(i) => &referer[i + 3..],
        None => referer,
    };
    let authority = rest
        .split(|c| c == '/' || c == '?' || c == '#')
        .next()
        .unwrap_or("");
    let host = authority.rsplit('@').next().unwrap_or(authority);
    host.split(':').next().unwrap_or("").to_string()
}

const SEARCH_ENGINES: &[&str] = &[
    "google",
    "baidu",
    "bing",
    "yahoo",
    "sogou",
    "360",
    "soso",
    "yandex",
    "duckduckgo",
];

const SOCIAL_NETWORKS: &[&str] = &[
    "facebook",
    "twitter",
    "linkedin",
    "weibo",
    "wechat",
    "qq",
    "instagram",
    "tiktok",
    "douyin",
    "reddit",
];

/// Traffic source classification: direct, search, social, other.
pub fn classify_referer(referer: &str) -> &'static str {
    if referer.is_empty() || referer == "-" {
        return "direct";
    }
    let domain = referer_domain(referer).to_lowercase();
    if SEARCH_ENGINES.iter().any(|se| domain.contains(se)) {
        return "search";
    }
    if SOCIAL_NETWORKS.iter().any(|sn| domain.contains(sn)) {
        return "social";
    }
    "other"
}

const STATIC_EXTENSIONS: &[&str] = &[
    ".css", ".js", ".png", ".jpg", ".jpeg", ".gif", ".ico", ".svg", ".woff", ".woff2", ".ttf",
    ".eot", ".map",
];

const HEALTH_PATHS: &[&str] = &["/health", "/ping", "/ready", "/live", "/metrics"];

/// A request counts as a page view when it is a successful page fetch:
/// static assets, API calls, health probes, and error responses are excluded.
pub fn is_page_view(uri: &str, status: i64) -> bool {
    let uri = uri.to_lowercase();
    let path = normalize_url(&uri);
    if STATIC_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        return false;
    }
    if uri.starts_with("/api") || uri.contains("/api/") {
        return false;
    }
    if HEALTH_PATHS.iter().any(|hp| uri.starts_with(hp)) {
        return false;
    }
    (200..400).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const COMBINED: &str = r#"203.0.113.9 - alice [07/Aug/2026:10:15:32 +0000] "GET /blog/post?id=7 HTTP/1.1" 200 5120 "https://www.google.com/search?q=x" "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Chrome/126.0.0.0" 0.034 0.030 example.com"#;

    #[test]
    fn combined_round_trip() {
        let e = parse_line(COMBINED, LogFormat::Combined).unwrap();
        assert_eq!(e.remote_addr, "203.0.113.9");
        assert_eq!(e.remote_user, "alice");
        assert_eq!(
            e.timestamp,
            Utc.with_ymd_and_hms(2026, 8, 7, 10, 15, 32).unwrap()
        );
        assert_eq!(e.method, "GET");
        assert_eq!(e.uri, "/blog/post?id=7");
        assert_eq!(e.protocol, "HTTP/1.1");
        assert_eq!(e.status, 200);
        assert_eq!(e.body_bytes, 5120);
        assert_eq!(e.referer, "https://www.google.com/search?q=x");
        assert!(e.user_agent.starts_with("Mozilla/5.0"));
        assert!((e.request_time - 0.034).abs() < 1e-9);
        assert!((e.upstream_time - 0.030).abs() < 1e-9);
        assert_eq!(e.host, "example.com");
    }

    #[test]
    fn combined_without_optional_suffix() {
        let line = r#"198.51.100.4 - - [07/Aug/2026:00:00:01 +0200] "POST /api/v1/login HTTP/2.0" 401 0 "-" "curl/8.5.0""#;
        let e = parse_line(line, LogFormat::Combined).unwrap();
        assert_eq!(e.remote_user, "");
        assert_eq!(e.referer, "");
        assert_eq!(e.status, 401);
        assert_eq!(e.request_time, 0.0);
        // +0200 normalizes to UTC
        assert_eq!(
            e.timestamp,
            Utc.with_ymd_and_hms(2026, 8, 6, 22, 0, 1).unwrap()
        );
    }

    #[test]
    fn garbage_status_zeroes_only_that_field() {
        let line = r#"198.51.100.4 - - [07/Aug/2026:01:02:03 +0000] "GET / HTTP/1.1" xx abc "-" "-""#;
        let e = parse_line(line, LogFormat::Combined).unwrap();
        assert_eq!(e.status, 0);
        assert_eq!(e.body_bytes, 0);
        assert_eq!(e.uri, "/");
    }

    #[test]
    fn unquoted_line_is_malformed() {
        assert!(parse_line("not a log line", LogFormat::Combined).is_err());
        assert!(parse_line("", LogFormat::Combined).is_err());
    }

    #[test]
    fn json_field_aliases() {
        let line = r#"{"@timestamp":"2026-08-07T10:15:32+00:00","client_ip":"203.0.113.9","request_method":"GET","request_uri":"/index.html","server_protocol":"HTTP/1.1","status_code":"200","bytes_sent":812,"referer":"https://duckduckgo.com/","user_agent":"Mozilla/5.0","request_time":"0.012","host":"example.com"}"#;
        let e = parse_line(line, LogFormat::Json).unwrap();
        assert_eq!(e.remote_addr, "203.0.113.9");
        assert_eq!(e.method, "GET");
        assert_eq!(e.uri, "/index.html");
        assert_eq!(e.status, 200);
        assert_eq!(e.body_bytes, 812);
        assert!((e.request_time - 0.012).abs() < 1e-9);
        assert_eq!(
            e.timestamp,
            Utc.with_ymd_and_hms(2026, 8, 7, 10, 15, 32).unwrap()
        );
    }

    #[test]
    fn json_forwarded_for_overrides_private_direct_address() {
        let line = r#"{"time":"2026-08-07T10:15:32Z","remote_addr":"10.42.0.7","x_forwarded_for":"203.0.113.77, 10.42.0.7","request":"GET /home HTTP/1.1","status":200,"body_bytes_sent":100,"http_user_agent":"-","http_referer":"-"}"#;
        let e = parse_line(line, LogFormat::Json).unwrap();
        assert_eq!(e.remote_addr, "203.0.113.77");
        assert_eq!(e.method, "GET");
        assert_eq!(e.uri, "/home");
    }

    #[test]
    fn json_without_timestamp_is_an_error() {
        let line = r#"{"remote_addr":"1.2.3.4","status":200}"#;
        assert!(parse_line(line, LogFormat::Json).is_err());
    }

    #[test]
    fn url_normalization_and_referer_domain() {
        assert_eq!(normalize_url("/a/b?x=1#frag"), "/a/b");
        assert_eq!(normalize_url("/plain"), "/plain");
        assert_eq!(referer_domain("https://blog.example.com:8443/p/1"), "blog.example.com");
        assert_eq!(referer_domain("example.com/path"), "example.com");
        assert_eq!(referer_domain("-"), "");
    }

    #[test]
    fn referer_classification() {
        assert_eq!(classify_referer(""), "direct");
        assert_eq!(classify_referer("https://www.google.com/search"), "search");
        assert_eq!(classify_referer("https://t.reddit.com/r/rust"), "social");
        assert_eq!(classify_referer("https://news.example.org/"), "other");
    }

    #[test]
    fn page_view_classification() {
        assert!(is_page_view("/blog/post", 200));
        assert!(is_page_view("/blog/post?utm=1", 302));
        assert!(!is_page_view("/static/app.js", 200));
        assert!(!is_page_view("/app.js?v=12", 200));
        assert!(!is_page_view("/api/v1/users", 200));
        assert!(!is_page_view("/health", 200));
        assert!(!is_page_view("/blog/post", 404));
        assert!(!is_page_view("/blog/post", 500));
    }

    #[test]
    fn hash_key_is_stable_hex() {
        let h = hash_key("GET /index.html example.com");
        assert_eq!(h.len(), 64);
        assert_eq!(h, hash_key("GET /index.html example.com"));
        assert_ne!(h, hash_key("GET /other example.com"));
    }
}

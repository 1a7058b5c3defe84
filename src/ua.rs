//! User-Agent string classification
//!
//! Substring scanning against ordered marker lists. Order matters: Edge UAs
//! contain "Chrome", Chrome UAs contain "Safari", so the first match in
//! precedence order wins.

/// Parsed User-Agent attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UaInfo {
    pub browser: String,
    pub browser_version: String,
    pub os: String,
    pub os_version: String,
    /// desktop, mobile, tablet, bot
    pub device_type: String,
    pub is_bot: bool,
}

impl Default for UaInfo {
    fn default() -> Self {
        Self {
            browser: "Unknown".to_string(),
            browser_version: String::new(),
            os: "Unknown".to_string(),
            os_version: String::new(),
            device_type: "desktop".to_string(),
            is_bot: false,
        }
    }
}

const BOT_MARKERS: &[&str] = &[
    "bot",
    "crawler",
    "spider",
    "scraper",
    "curl",
    "wget",
    "python",
    "java",
    "go-http",
    "node-fetch",
    "axios",
    "httpclient",
    "slurp",
    "duckduck",
    "facebookexternalhit",
    "monitoring",
    "uptime",
    "pingdom",
    "newrelic",
    "datadog",
    "prometheus",
];

const MOBILE_MARKERS: &[&str] = &[
    "iphone",
    "ipod",
    "windows phone",
    "blackberry",
    "iemobile",
    "opera mini",
    "opera mobi",
];

const TABLET_MARKERS: &[&str] = &["ipad", "tablet", "playbook", "silk"];

/// User-Agent parser
pub struct UaParser;

impl UaParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(&self, ua: &str) -> UaInfo {
        let mut info = UaInfo::default();

        if ua.is_empty() || ua == "-" {
            return info;
        }

        let lower = ua.to_lowercase();

        if BOT_MARKERS.iter().any(|m| lower.contains(m)) {
            info.is_bot = true;
            info.device_type = "bot".to_string();
        }

        self.detect_browser(ua, &mut info);
        self.detect_os(ua, &mut info);

        if !info.is_bot {
            let android = lower.contains("android");
            if TABLET_MARKERS.iter().any(|m| lower.contains(m))
                || (android && !lower.contains("mobile"))
            {
                info.device_type = "tablet".to_string();
            } else if MOBILE_MARKERS.iter().any(|m| lower.contains(m))
                || (android && lower.contains("mobile"))
            {
                info.device_type = "mobile".to_string();
            }
        }

        info
    }

    fn detect_browser(&self, ua: &str, info: &mut UaInfo) {
        // Precedence: Edge > Chrome > Firefox > Safari > Opera > IE
        let candidates: &[(&str, &[&str])] = &[
            ("Edge", &["Edg/", "EdgA/", "Edge/"]),
            ("Chrome", &["Chrome/"]),
            ("Firefox", &["Firefox/"]),
            ("Safari", &["Version/"]),
            ("Opera", &["OPR/", "Opera/"]),
            ("IE", &["MSIE ", "rv:"]),
        ];

        for (name, tokens) in candidates {
            // Safari's version token also appears in mobile Safari UAs that
            // end in "Safari/605..."; require the Safari marker itself.
            if *name == "Safari" && !ua.contains("Safari") {
                continue;
            }
            if *name == "IE" && !(ua.contains("MSIE") || ua.contains("Trident")) {
                continue;
            }
            for token in *tokens {
                if let Some(version) = version_after(ua, token) {
                    info.browser = name.to_string();
                    info.browser_version = version;
                    return;
                }
            }
        }
    }

    fn detect_os(&self, ua: &str, info: &mut UaInfo) {
        // Precedence: iOS > Android > Windows > macOS > Linux
        if ua.contains("iPhone") || ua.contains("iPad") || ua.contains("iPod") {
            info.os = "iOS".to_string();
            if let Some(v) = version_after(ua, "OS ") {
                info.os_version = v.replace('_', ".");
            }
        } else if ua.contains("Android") {
            info.os = "Android".to_string();
            if let Some(v) = version_after(ua, "Android ") {
                info.os_version = v;
            }
        } else if ua.contains("Windows NT") {
            info.os = "Windows".to_string();
            if let Some(v) = version_after(ua, "Windows NT ") {
                info.os_version = v;
            }
        } else if ua.contains("Mac OS X") {
            info.os = "macOS".to_string();
            if let Some(v) = version_after(ua, "Mac OS X ") {
                info.os_version = v.replace('_', ".");
            }
        } else if ua.contains("Linux") {
            info.os = "Linux".to_string();
        }
    }
}

impl Default for UaParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Digits/dots/underscores following `token`, or None when the token is
/// absent or not followed by a version.
fn version_after(ua: &str, token: &str) -> Option<String> {
    let start = ua.find(token)? + token.len();
    let version: String = ua[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '_')
        .collect();
    if version.is_empty() {
        None
    } else {
        Some(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chrome_on_windows() {
        let ua = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";
        let info = UaParser::new().parse(ua);
        assert_eq!(info.browser, "Chrome");
        assert_eq!(info.browser_version, "126.0.0.0");
        assert_eq!(info.os, "Windows");
        assert_eq!(info.os_version, "10.0");
        assert_eq!(info.device_type, "desktop");
        assert!(!info.is_bot);
    }

    #[test]
    fn edge_wins_over_chrome() {
        let ua = "Mozilla/5.0 (Windows NT 10.0) AppleWebKit/537.36 Chrome/125.0.0.0 Safari/537.36 Edg/125.0.2535.67";
        let info = UaParser::new().parse(ua);
        assert_eq!(info.browser, "Edge");
        assert_eq!(info.browser_version, "125.0.2535.67");
    }

    #[test]
    fn mobile_safari_on_ios() {
        let ua = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_5 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Mobile/15E148 Safari/604.1";
        let info = UaParser::new().parse(ua);
        assert_eq!(info.browser, "Safari");
        assert_eq!(info.os, "iOS");
        assert_eq!(info.os_version, "17.5");
        assert_eq!(info.device_type, "mobile");
    }

    #[test]
    fn android_without_mobile_is_tablet() {
        let ua = "Mozilla/5.0 (Linux; Android 13; SM-X700) AppleWebKit/537.36 Chrome/120.0.0.0 Safari/537.36";
        let info = UaParser::new().parse(ua);
        assert_eq!(info.os, "Android");
        assert_eq!(info.device_type, "tablet");
    }

    #[test]
    fn crawlers_and_tools_are_bots() {
        for ua in [
            "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)",
            "curl/8.5.0",
            "python-requests/2.32.0",
        ] {
            let info = UaParser::new().parse(ua);
            assert!(info.is_bot, "{ua}");
            assert_eq!(info.device_type, "bot");
        }
    }

    #[test]
    fn empty_ua_is_unknown_desktop() {
        let info = UaParser::new().parse("-");
        assert_eq!(info.browser, "Unknown");
        assert_eq!(info.os, "Unknown");
        assert_eq!(info.device_type, "desktop");
    }
}

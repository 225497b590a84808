//! Extraction of typed values from raw page bodies.
//!
//! The client never interprets page markup itself; it asks a
//! [`PageExtractor`] for the handful of values the session engine needs.

use regex::Regex;

pub trait PageExtractor: Send + Sync {
    /// Anti-forgery token embedded in a page.
    fn anti_forgery_token(&self, body: &str) -> Option<String>;

    /// Relative profile links (`/users/...`, `/model/...`) found in a page.
    fn user_links(&self, body: &str) -> Vec<String>;

    /// Relative video links found in a page.
    fn video_links(&self, body: &str) -> Vec<String>;
}

pub struct RegexExtractor {
    token: Regex,
    users: Regex,
    videos: Regex,
}

/// First capture of every match, de-duplicated in page order.
fn unique_captures(pattern: &Regex, body: &str) -> Vec<String> {
    let mut links: Vec<String> = Vec::new();
    for link in pattern.captures_iter(body).filter_map(|c| c.get(1)) {
        if !links.iter().any(|l| l == link.as_str()) {
            links.push(link.as_str().to_string());
        }
    }
    links
}

impl Default for RegexExtractor {
    fn default() -> Self {
        Self {
            token: Regex::new(r#"(?:name=["']token["']\s+value=|\btoken\s*[:=]\s*)["']([^"']+)["']"#)
                .expect("token pattern is valid"),
            users: Regex::new(r#"href=["'](/(?:users|model|channels|pornstar)/[^"'?#]+)["']"#)
                .expect("user link pattern is valid"),
            videos: Regex::new(r#"href=["'](/view_video\.php\?viewkey=[A-Za-z0-9]+)["'&]"#)
                .expect("video link pattern is valid"),
        }
    }
}

impl PageExtractor for RegexExtractor {
    fn anti_forgery_token(&self, body: &str) -> Option<String> {
        self.token
            .captures(body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }

    fn user_links(&self, body: &str) -> Vec<String> {
        unique_captures(&self.users, body)
    }

    fn video_links(&self, body: &str) -> Vec<String> {
        unique_captures(&self.videos, body)
    }
}

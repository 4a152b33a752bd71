//! Origin allow-list for `Access-Control-Allow-Origin`.

use axum::http::HeaderValue;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
enum OriginRule {
    Any,
    /// Exact host, e.g. `cdn.example.com`.
    Host(String),
    /// `*.example.com`: any subdomain of `example.com`.
    Subdomains(String),
}

#[derive(Debug, Clone, Default)]
pub struct CorsPolicy {
    rules: Vec<OriginRule>,
}

impl CorsPolicy {
    /// Entries may be `*`, a bare host, a host with scheme (`https://app.example.com`), or
    /// `*.example.com`. Matching is on host only and case-insensitive.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let rules = entries
            .into_iter()
            .filter_map(|entry| parse_rule(entry.as_ref()))
            .collect();
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn allows(&self, origin: &str) -> bool {
        if self.rules.contains(&OriginRule::Any) {
            return true;
        }
        let Some(host) = origin_host(origin) else {
            return false;
        };

        self.rules.iter().any(|rule| match rule {
            OriginRule::Any => true,
            OriginRule::Host(allowed) => *allowed == host,
            OriginRule::Subdomains(suffix) => host
                .strip_suffix(suffix.as_str())
                .is_some_and(|label| label.len() > 1 && label.ends_with('.')),
        })
    }

    /// Value to echo back for `origin`, if it is allowed.
    pub fn allow_origin(&self, origin: Option<&HeaderValue>) -> Option<HeaderValue> {
        let origin = origin?;
        let text = origin.to_str().ok()?;
        self.allows(text).then(|| origin.clone())
    }
}

fn parse_rule(entry: &str) -> Option<OriginRule> {
    let entry = entry.trim().to_ascii_lowercase();
    if entry.is_empty() {
        return None;
    }
    if entry == "*" {
        return Some(OriginRule::Any);
    }
    if let Some(suffix) = entry.strip_prefix("*.") {
        return (!suffix.is_empty()).then(|| OriginRule::Subdomains(suffix.to_string()));
    }
    origin_host(&entry).map(OriginRule::Host)
}

/// Lowercased host of an origin, accepting either a full origin or a bare host.
fn origin_host(origin: &str) -> Option<String> {
    let origin = origin.trim();
    let parsed = if origin.contains("://") {
        Url::parse(origin).ok()?
    } else {
        Url::parse(&format!("http://{origin}")).ok()?
    };
    parsed.host_str().map(str::to_ascii_lowercase)
}

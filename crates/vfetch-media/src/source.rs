//! Source URL validation and normalization.
//!
//! Runs before any workspace is allocated or process spawned. A URL that
//! passes is guaranteed to start with `http://` or `https://`, so it can never
//! be read as a flag by the downloader.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::error::{MediaError, MediaResult};

/// Basename used when a URL carries no usable identifier.
pub const FALLBACK_MEDIA_ID: &str = "media";

const MAX_MEDIA_ID_LEN: usize = 64;

static LOOM_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/(?:share|embed)/([A-Za-z0-9]+)").unwrap());

/// Host allow-list for source URLs.
#[derive(Debug, Clone)]
pub struct SourcePolicy {
    allowed_hosts: Vec<String>,
}

impl SourcePolicy {
    /// Entries are matched case-insensitively; subdomains of an entry match too.
    pub fn new<I, S>(allowed_hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed_hosts: allowed_hosts
                .into_iter()
                .map(|h| h.as_ref().trim().trim_end_matches('.').to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
        }
    }

    pub fn allowed_hosts(&self) -> &[String] {
        &self.allowed_hosts
    }

    pub fn is_allowed_host(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.allowed_hosts.iter().any(|allowed| {
            host == *allowed
                || host
                    .strip_suffix(allowed.as_str())
                    .map(|prefix| prefix.ends_with('.'))
                    .unwrap_or(false)
        })
    }

    /// Validate a raw URL string.
    ///
    /// Rejects anything that is not a plain http(s) URL on an allowed host:
    /// embedded credentials, whitespace, control characters and leading
    /// dashes included.
    pub fn validate(&self, raw: &str) -> MediaResult<SourceUrl> {
        if raw.is_empty() {
            return Err(MediaError::invalid_source("URL is empty"));
        }
        if raw.starts_with('-') {
            return Err(MediaError::invalid_source("URL must not start with '-'"));
        }
        if raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(MediaError::invalid_source(
                "URL contains whitespace or control characters",
            ));
        }

        let url = Url::parse(raw).map_err(|e| MediaError::invalid_source(format!("unparseable URL: {e}")))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(MediaError::invalid_source(format!(
                "scheme '{}' is not allowed",
                url.scheme()
            )));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(MediaError::invalid_source("URL must not carry credentials"));
        }
        let host = url
            .host_str()
            .ok_or_else(|| MediaError::invalid_source("URL has no host"))?
            .to_ascii_lowercase();
        if !self.is_allowed_host(&host) {
            return Err(MediaError::invalid_source(format!("host '{host}' is not allowed")));
        }

        let media_id = media_id_for(&host, url.path());
        let normalized = normalize(&url, &host);
        let mut url = url;
        url.set_fragment(None);

        Ok(SourceUrl {
            url,
            host,
            media_id,
            normalized,
        })
    }
}

/// A validated source URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUrl {
    url: Url,
    host: String,
    media_id: String,
    normalized: String,
}

impl SourceUrl {
    /// URL handed to the downloader, fragment removed.
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Filesystem-safe basename for the downloaded file.
    pub fn media_id(&self) -> &str {
        &self.media_id
    }

    /// Canonical form used for request coalescing.
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    pub fn is_loom(&self) -> bool {
        is_loom_host(&self.host)
    }

    /// Direct CDN location of a Loom recording, if this is a Loom share/embed link.
    pub fn loom_cdn_url(&self) -> Option<String> {
        if !self.is_loom() {
            return None;
        }
        LOOM_PATH
            .captures(self.url.path())
            .and_then(|c| c.get(1))
            .map(|id| format!("https://cdn.loom.com/sessions/thumbnails/{}.mp4", id.as_str()))
    }
}

fn is_loom_host(host: &str) -> bool {
    host == "loom.com" || host.ends_with(".loom.com")
}

/// Loom share/embed ids are used verbatim; anything else uses the sanitized
/// stem of the last path segment.
fn media_id_for(host: &str, path: &str) -> String {
    if is_loom_host(host) {
        if let Some(id) = LOOM_PATH.captures(path).and_then(|c| c.get(1)) {
            return truncate_id(id.as_str());
        }
    }

    let segment = path.rsplit('/').find(|s| !s.is_empty()).unwrap_or_default();
    let stem = segment.split('.').next().unwrap_or_default();
    let sanitized: String = stem
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    let sanitized = sanitized.trim_start_matches('-');
    if sanitized.is_empty() {
        FALLBACK_MEDIA_ID.to_string()
    } else {
        truncate_id(sanitized)
    }
}

fn truncate_id(id: &str) -> String {
    // ASCII only at this point, so byte slicing is safe.
    id[..id.len().min(MAX_MEDIA_ID_LEN)].to_string()
}

fn normalize(url: &Url, host: &str) -> String {
    let host = host.strip_prefix("www.").unwrap_or(host);
    let mut out = format!("{}://{}", url.scheme(), host);
    if let Some(port) = url.port() {
        out.push_str(&format!(":{port}"));
    }
    let path = url.path().trim_end_matches('/');
    out.push_str(path);
    if let Some(query) = url.query().filter(|q| !q.is_empty()) {
        out.push('?');
        out.push_str(query);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> SourcePolicy {
        SourcePolicy::new(["loom.com", "www.loom.com", "cdn.loom.com"])
    }

    #[test]
    fn test_loom_share_url() {
        let src = policy().validate("https://loom.com/share/abc123").unwrap();
        assert_eq!(src.media_id(), "abc123");
        assert_eq!(src.normalized(), "https://loom.com/share/abc123");
        assert_eq!(
            src.loom_cdn_url().as_deref(),
            Some("https://cdn.loom.com/sessions/thumbnails/abc123.mp4")
        );
    }

    #[test]
    fn test_normalization_coalesces_variants() {
        let p = policy();
        let a = p.validate("https://www.loom.com/share/abc123/").unwrap();
        let b = p.validate("https://LOOM.com/share/abc123#t=10").unwrap();
        assert_eq!(a.normalized(), b.normalized());
        assert!(!b.as_str().contains('#'));
    }

    #[test]
    fn test_embed_and_query() {
        let src = policy()
            .validate("https://www.loom.com/embed/0cd67c5205e34420be284171e3d37060?sid=1")
            .unwrap();
        assert_eq!(src.media_id(), "0cd67c5205e34420be284171e3d37060");
        assert_eq!(
            src.normalized(),
            "https://loom.com/embed/0cd67c5205e34420be284171e3d37060?sid=1"
        );
    }

    #[test]
    fn test_rejects_disallowed_host() {
        let err = policy().validate("https://malicious.test/--exec=rm").unwrap_err();
        assert!(matches!(err, MediaError::InvalidSource(_)));
        assert!(policy().validate("https://notloom.com/share/abc").is_err());
        assert!(policy().validate("https://loom.com.evil.test/share/abc").is_err());
    }

    #[test]
    fn test_subdomains_match() {
        let p = SourcePolicy::new(["loom.com"]);
        assert!(p.is_allowed_host("video.loom.com"));
        assert!(p.is_allowed_host("LOOM.COM."));
        assert!(!p.is_allowed_host("xloom.com"));
    }

    #[test]
    fn test_rejects_injection_shapes() {
        let p = policy();
        for raw in [
            "",
            "--exec=rm -rf /",
            "-o/etc/passwd",
            "https://loom.com/share/abc 123",
            "https://loom.com/share/abc\n--exec",
            "ftp://loom.com/share/abc",
            "file:///etc/passwd",
            "https://user:pw@loom.com/share/abc",
            "loom.com/share/abc",
        ] {
            assert!(
                matches!(p.validate(raw), Err(MediaError::InvalidSource(_))),
                "accepted {raw:?}"
            );
        }
    }

    #[test]
    fn test_non_loom_media_id() {
        let p = SourcePolicy::new(["videos.example.com", "cdn.loom.com"]);
        let src = p.validate("https://videos.example.com/a/b/My Clip.final.mp4".replace(' ', "%20").as_str()).unwrap();
        assert_eq!(src.media_id(), "My20Clip");
        assert!(src.loom_cdn_url().is_none());

        let src = p.validate("https://videos.example.com/").unwrap();
        assert_eq!(src.media_id(), FALLBACK_MEDIA_ID);

        let src = p
            .validate("https://cdn.loom.com/sessions/thumbnails/abc123.mp4")
            .unwrap();
        assert_eq!(src.media_id(), "abc123");
    }
}

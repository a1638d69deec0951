//! Deduplication key for coalescing identical requests.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::format::TargetFormat;

/// Normalized `(source URL, target format)` pair.
///
/// The URL part is expected to already be normalized by the caller
/// (lowercase host, no fragment, no trailing slash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct DedupKey {
    pub url: String,
    pub format: TargetFormat,
}

impl DedupKey {
    pub fn new(normalized_url: impl Into<String>, format: TargetFormat) -> Self {
        Self {
            url: normalized_url.into(),
            format,
        }
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.url, self.format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OutputFormat;
    use std::collections::HashSet;

    #[test]
    fn test_format_is_part_of_key() {
        let a = DedupKey::new("https://loom.com/share/abc", TargetFormat::Native);
        let b = DedupKey::new("https://loom.com/share/abc", TargetFormat::Convert(OutputFormat::Mp4));
        let c = DedupKey::new("https://loom.com/share/abc", TargetFormat::Native);

        let set: HashSet<_> = [a.clone(), b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert_eq!(a.to_string(), "https://loom.com/share/abc#native");
    }
}

use crate::headers::{RequestHeaders, VaryAllowList};
use std::fmt;

/// Canonical identity of a cache entry.
///
/// GET and HEAD share a key so a HEAD can be answered from a stored GET.
/// Vary-relevant request headers (those on the allow-list) are part of the
/// key so each variant gets its own entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    scheme: String,
    authority: String,
    path_and_query: String,
    vary: Vec<String>,
}

impl Key {
    pub fn from_request(request: &RequestHeaders, allow_list: &VaryAllowList) -> Self {
        Self {
            scheme: request.scheme().unwrap_or("http").to_ascii_lowercase(),
            authority: request.host().unwrap_or_default().to_ascii_lowercase(),
            path_and_query: request
                .uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            vary: allow_list.request_values(&request.headers),
        }
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn path_and_query(&self) -> &str {
        &self.path_and_query
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.authority, self.path_and_query)?;
        for v in &self.vary {
            write!(f, " [{}]", v)?;
        }
        Ok(())
    }
}

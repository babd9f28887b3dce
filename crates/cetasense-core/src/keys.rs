//! Status store key conventions.
//!
//! These names are shared with the external worker and must stay stable:
//!
//! | Role          | Key                   |
//! |---------------|-----------------------|
//! | status hash   | `status:<job_id>`     |
//! | notify channel| `notify:<job_id>`     |
//! | response cache| `cache:<METHOD>:<URI>`|

use crate::job::JobId;

pub const STATUS_KEY_PREFIX: &str = "status:";
pub const NOTIFY_CHANNEL_PREFIX: &str = "notify:";
pub const CACHE_KEY_PREFIX: &str = "cache:";

#[inline]
pub fn status_key(job_id: &JobId) -> String {
    format!("{STATUS_KEY_PREFIX}{job_id}")
}

#[inline]
pub fn notify_channel(job_id: &JobId) -> String {
    format!("{NOTIFY_CHANNEL_PREFIX}{job_id}")
}

#[inline]
pub fn cache_key(method: &str, canonical_uri: &str) -> String {
    format!("{CACHE_KEY_PREFIX}{method}:{canonical_uri}")
}

/// Path plus query string with its `&`-separated pairs sorted, so that
/// `?b=2&a=1` and `?a=1&b=2` share a cache entry.
pub fn canonical_uri(path: &str, query: Option<&str>) -> String {
    let mut pairs: Vec<&str> = query
        .unwrap_or("")
        .split('&')
        .filter(|p| !p.is_empty())
        .collect();
    if pairs.is_empty() {
        return path.to_string();
    }
    pairs.sort_unstable();
    format!("{path}?{}", pairs.join("&"))
}

/// Escape glob metacharacters so `s` matches itself literally in a
/// store key pattern.
pub fn escape_glob(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Match `key` against a store key pattern (`*`, `?` and `\` escapes).
///
/// Character classes are not supported; a `[` is matched literally.
pub fn glob_match(pattern: &str, key: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let key: Vec<char> = key.chars().collect();

    let (mut p, mut k) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while k < key.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, k));
                p += 1;
                continue;
            }
            Some('?') => {
                p += 1;
                k += 1;
                continue;
            }
            Some('\\') if p + 1 < pattern.len() => {
                if pattern[p + 1] == key[k] {
                    p += 2;
                    k += 1;
                    continue;
                }
            }
            Some(&c) if c == key[k] => {
                p += 1;
                k += 1;
                continue;
            }
            _ => {}
        }

        match backtrack {
            Some((star_p, star_k)) => {
                p = star_p + 1;
                k = star_k + 1;
                backtrack = Some((star_p, star_k + 1));
            }
            None => return false,
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}

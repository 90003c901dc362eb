//! Key layout under the configured prefix.
//!
//! ```text
//! <prefix>/leaders/<namespace>/<id>       member record + election candidacy
//! <prefix>/locks/<id>/<lease hex>         lock holder record
//! ```
//!
//! Namespaces and ids are escaped into a single path segment: `%` becomes
//! `%25` and `/` becomes `%2F`. The mapping is reversible, so departed members
//! can be reported by id from a delete event's key alone.

use conclave_kv::LeaseId;

/// Path segment holding member records.
pub const LEADERS_SEGMENT: &str = "leaders";

/// Path segment holding lock holder records.
pub const LOCKS_SEGMENT: &str = "locks";

/// Escape a namespace or id so it contains no `/`.
pub fn escape_segment(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            '/' => escaped.push_str("%2F"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Reverse [`escape_segment`]. Unknown `%` sequences are kept verbatim.
pub fn unescape_segment(escaped: &str) -> String {
    let mut raw = String::with_capacity(escaped.len());
    let mut rest = escaped;
    while let Some(pos) = rest.find('%') {
        raw.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.starts_with("%25") {
            raw.push('%');
            rest = &tail[3..];
        } else if tail.starts_with("%2F") || tail.starts_with("%2f") {
            raw.push('/');
            rest = &tail[3..];
        } else {
            raw.push('%');
            rest = &tail[1..];
        }
    }
    raw.push_str(rest);
    raw
}

/// Strip trailing separators so joined keys never contain `//`.
pub fn normalize_prefix(prefix: &str) -> String {
    prefix.trim_end_matches('/').to_string()
}

/// Scan prefix covering every member of `namespace`. Ends with `/`.
pub fn members_prefix(prefix: &str, namespace: &str) -> String {
    format!("{prefix}/{LEADERS_SEGMENT}/{}/", escape_segment(namespace))
}

/// Key of one member record.
pub fn member_key(prefix: &str, namespace: &str, id: &str) -> String {
    format!("{}{}", members_prefix(prefix, namespace), escape_segment(id))
}

/// Scan prefix covering every holder of lock `id`. Ends with `/`.
pub fn lock_prefix(prefix: &str, id: &str) -> String {
    format!("{prefix}/{LOCKS_SEGMENT}/{}/", escape_segment(id))
}

/// Key a session writes while holding or waiting for a lock.
pub fn lock_holder_key(lock_prefix: &str, lease: LeaseId) -> String {
    format!("{lock_prefix}{lease}")
}

/// Final path segment of a key.
pub fn last_segment(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn member_key_layout() {
        assert_eq!(member_key("/app/sync", "svc", "node-1"), "/app/sync/leaders/svc/node-1");
        assert_eq!(members_prefix("/app/sync", "svc"), "/app/sync/leaders/svc/");
    }

    #[test]
    fn slashes_are_escaped_into_one_segment() {
        let key = member_key("/app/sync", "team/a", "host/1");
        assert_eq!(key, "/app/sync/leaders/team%2Fa/host%2F1");
        assert_eq!(unescape_segment(last_segment(&key)), "host/1");
    }

    #[test]
    fn escaped_names_do_not_collide() {
        assert_ne!(escape_segment("a/b"), escape_segment("a-b"));
        assert_ne!(escape_segment("a/b"), escape_segment("a%2Fb"));
    }

    #[test]
    fn lock_keys_include_lease_hex() {
        let prefix = lock_prefix("/app/sync", "jobs/nightly");
        assert_eq!(prefix, "/app/sync/locks/jobs%2Fnightly/");
        assert_eq!(lock_holder_key(&prefix, LeaseId::new(0xabc)), "/app/sync/locks/jobs%2Fnightly/abc");
    }

    #[test]
    fn normalize_prefix_trims_trailing_separators() {
        assert_eq!(normalize_prefix("/app/sync//"), "/app/sync");
        assert_eq!(normalize_prefix("/app/sync"), "/app/sync");
    }

    #[test]
    fn unescape_keeps_unknown_sequences() {
        assert_eq!(unescape_segment("100%"), "100%");
        assert_eq!(unescape_segment("%41b"), "%41b");
        assert_eq!(unescape_segment("a%2fb"), "a/b");
    }

    proptest! {
        #[test]
        fn escape_round_trips(raw in ".*") {
            prop_assert_eq!(unescape_segment(&escape_segment(&raw)), raw);
        }

        #[test]
        fn escaped_segment_has_no_separator(raw in ".*") {
            prop_assert!(!escape_segment(&raw).contains('/'));
        }

        #[test]
        fn member_keys_stay_under_namespace_prefix(ns in "[a-z/]{1,8}", id in ".{0,16}") {
            let key = member_key("/p", &ns, &id);
            let prefix = members_prefix("/p", &ns);
            prop_assert!(key.starts_with(&prefix));
            prop_assert!(!key[prefix.len()..].contains('/'));
        }
    }
}

//! Reconcile keys: `"<namespace>/<name>"` identifiers for releases.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Release;

const MAX_NAME_LEN: usize = 253;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("malformed key {key:?}: {reason}")]
    Malformed { key: String, reason: &'static str },
    #[error("object has no metadata.namespace")]
    MissingNamespace,
    #[error("object has no metadata.name")]
    MissingName,
}

/// Opaque queue key for a release. Two notifications for the same object
/// always produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReleaseKey(String);

impl ReleaseKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self(format!("{}/{}", namespace, name))
    }

    /// Wrap an already-encoded key without validating it. Validation happens
    /// on [`ReleaseKey::split`].
    pub fn from_raw(raw: impl Into<String>) -> Self { Self(raw.into()) }

    pub fn for_release(release: &Release) -> Result<Self, KeyError> {
        let namespace = release
            .metadata
            .namespace
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(KeyError::MissingNamespace)?;
        let name = release
            .metadata
            .name
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(KeyError::MissingName)?;
        Ok(Self::new(namespace, name))
    }

    pub fn as_str(&self) -> &str { &self.0 }

    /// Decode into `(namespace, name)`.
    pub fn split(&self) -> Result<(&str, &str), KeyError> {
        let malformed = |reason| KeyError::Malformed { key: self.0.clone(), reason };
        let mut parts = self.0.split('/');
        let (namespace, name) = match (parts.next(), parts.next(), parts.next()) {
            (Some(ns), Some(name), None) => (ns, name),
            (_, None, _) => return Err(malformed("expected <namespace>/<name>")),
            _ => return Err(malformed("too many '/' separators")),
        };
        if namespace.is_empty() {
            return Err(malformed("empty namespace"));
        }
        if name.is_empty() {
            return Err(malformed("empty name"));
        }
        if !valid_name(namespace) || !valid_name(name) {
            return Err(malformed("invalid characters in namespace or name"));
        }
        Ok((namespace, name))
    }
}

fn valid_name(s: &str) -> bool {
    s.len() <= MAX_NAME_LEN
        && s.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.')
}

impl fmt::Display for ReleaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReleaseSpec;

    #[test]
    fn split_roundtrips_namespace_and_name() {
        let k = ReleaseKey::new("a", "r1");
        assert_eq!(k.as_str(), "a/r1");
        assert_eq!(k.split().unwrap(), ("a", "r1"));
    }

    #[test]
    fn malformed_keys_are_errors() {
        for raw in ["bad::key::format", "a/b/c", "/r1", "a/", "", "A/r1", "a/r_1"] {
            let err = ReleaseKey::from_raw(raw).split().unwrap_err();
            assert!(matches!(err, KeyError::Malformed { .. }), "{raw} -> {err:?}");
        }
    }

    #[test]
    fn key_for_release_requires_namespace() {
        let mut r = Release::new("r1", ReleaseSpec::default());
        assert_eq!(ReleaseKey::for_release(&r), Err(KeyError::MissingNamespace));
        r.metadata.namespace = Some("a".into());
        assert_eq!(ReleaseKey::for_release(&r).unwrap(), ReleaseKey::new("a", "r1"));
    }
}

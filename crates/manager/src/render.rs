//! Manifest rendering. The production renderer does no templating: it splits
//! pre-rendered multi-document YAML into objects and stamps ownership labels.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use relctl_core::Release;
use relctl_persist::ResourceRef;
use serde::Deserialize;
use serde_json::Value as Json;

use crate::error::ManagerError;

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const RELEASE_LABEL: &str = "relctl.io/release";

/// One object ready to apply.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedObject {
    pub resource: ResourceRef,
    pub body: Json,
}

pub trait Renderer: Send + Sync {
    /// Turn `manifests` into objects for `release`. Called with the release's
    /// own manifests, or a recorded revision's during a rollback.
    fn render(&self, release: &Release, manifests: &str) -> Result<Vec<RenderedObject>>;
}

#[derive(Debug, Clone)]
pub struct PassthroughRenderer {
    pub max_bytes: usize,
    pub max_nodes: usize,
}

impl Default for PassthroughRenderer {
    fn default() -> Self { Self { max_bytes: 1_000_000, max_nodes: 100_000 } }
}

impl Renderer for PassthroughRenderer {
    fn render(&self, release: &Release, manifests: &str) -> Result<Vec<RenderedObject>> {
        if manifests.len() > self.max_bytes {
            return Err(ManagerError::TooLarge { limit: self.max_bytes }.into());
        }
        let default_ns = release.metadata.namespace.as_deref();
        let owner = release.metadata.name.clone().unwrap_or_default();
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for (doc, de) in serde_yaml::Deserializer::from_str(manifests).enumerate() {
            let val = serde_yaml::Value::deserialize(de).map_err(|source| ManagerError::Yaml { doc, source })?;
            if val.is_null() {
                continue;
            }
            let mut body = serde_json::to_value(val).context("converting YAML to JSON")?;
            if node_budget_exceeded(&body, self.max_nodes) {
                return Err(ManagerError::TooComplex { doc, limit: self.max_nodes }.into());
            }
            let resource = target_of(&body, doc, default_ns)?;
            if !seen.insert(resource.clone()) {
                return Err(ManagerError::DuplicateResource(resource.to_string()).into());
            }
            stamp(&mut body, &resource, &owner);
            out.push(RenderedObject { resource, body });
        }
        Ok(out)
    }
}

fn target_of(body: &Json, doc: usize, default_ns: Option<&str>) -> Result<ResourceRef, ManagerError> {
    let field = |path: &[&str], name: &'static str| -> Result<String, ManagerError> {
        let mut cur = body;
        for p in path {
            cur = cur.get(*p).ok_or(ManagerError::MissingField { doc, field: name })?;
        }
        cur.as_str().map(str::to_string).ok_or(ManagerError::MissingField { doc, field: name })
    };
    let api_version = field(&["apiVersion"], "apiVersion")?;
    let kind = field(&["kind"], "kind")?;
    let name = field(&["metadata", "name"], "metadata.name")?;
    let namespace = body
        .get("metadata")
        .and_then(|m| m.get("namespace"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| default_ns.map(str::to_string));
    Ok(ResourceRef { api_version, kind, namespace, name })
}

fn stamp(body: &mut Json, resource: &ResourceRef, owner: &str) {
    let Some(meta) = body.get_mut("metadata").and_then(Json::as_object_mut) else { return };
    if let Some(ns) = &resource.namespace {
        meta.insert("namespace".into(), Json::String(ns.clone()));
    }
    let labels = meta.entry("labels").or_insert_with(|| Json::Object(serde_json::Map::new()));
    if let Some(labels) = labels.as_object_mut() {
        labels.insert(MANAGED_BY_LABEL.into(), Json::String("relctl".into()));
        labels.insert(RELEASE_LABEL.into(), Json::String(owner.to_string()));
    }
}

fn node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => map.values().for_each(|vv| walk(vv, cur, max)),
            Json::Array(arr) => arr.iter().for_each(|vv| walk(vv, cur, max)),
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

#[cfg(test)]
mod tests {
    use super::*;
    use relctl_core::ReleaseSpec;

    fn release() -> Release {
        let mut r = Release::new("web", ReleaseSpec::default());
        r.metadata.namespace = Some("apps".into());
        r
    }

    const TWO_DOCS: &str = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: web-config
data:
  k: v
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: web-reader
  namespace: other
";

    #[test]
    fn splits_documents_and_defaults_namespace() {
        let objs = PassthroughRenderer::default().render(&release(), TWO_DOCS).unwrap();
        assert_eq!(objs.len(), 2);
        assert_eq!(objs[0].resource.kind, "ConfigMap");
        assert_eq!(objs[0].resource.namespace.as_deref(), Some("apps"));
        assert_eq!(objs[0].body["metadata"]["namespace"], "apps");
        assert_eq!(objs[1].resource.api_version, "rbac.authorization.k8s.io/v1");
        assert_eq!(objs[1].resource.namespace.as_deref(), Some("other"));
    }

    #[test]
    fn stamps_ownership_labels() {
        let objs = PassthroughRenderer::default().render(&release(), TWO_DOCS).unwrap();
        let labels = &objs[0].body["metadata"]["labels"];
        assert_eq!(labels[MANAGED_BY_LABEL], "relctl");
        assert_eq!(labels[RELEASE_LABEL], "web");
    }

    #[test]
    fn empty_documents_are_skipped() {
        let objs = PassthroughRenderer::default().render(&release(), "---\n---\n").unwrap();
        assert!(objs.is_empty());
    }

    #[test]
    fn missing_fields_are_reported_per_document() {
        let y = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\nkind: Foo\nmetadata:\n  name: x\n";
        let e = PassthroughRenderer::default().render(&release(), y).unwrap_err().to_string();
        assert!(e.contains("document 1") && e.contains("apiVersion"), "e={e}");

        let y = "apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n";
        let e = PassthroughRenderer::default().render(&release(), y).unwrap_err().to_string();
        assert!(e.contains("metadata.name"), "e={e}");
    }

    #[test]
    fn duplicates_are_rejected() {
        let y = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n";
        let e = PassthroughRenderer::default().render(&release(), y).unwrap_err().to_string();
        assert!(e.contains("more than once"), "e={e}");
    }

    #[test]
    fn size_and_node_budgets_apply() {
        let small = PassthroughRenderer { max_bytes: 10, max_nodes: 100 };
        assert!(small.render(&release(), TWO_DOCS).is_err());
        let shallow = PassthroughRenderer { max_bytes: 1_000_000, max_nodes: 3 };
        let e = shallow.render(&release(), TWO_DOCS).unwrap_err().to_string();
        assert!(e.contains("too complex"), "e={e}");
    }
}

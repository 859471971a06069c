//! relctl kubehub: kube client, discovery helpers and the `Release` watcher

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use kube::{
    api::Api,
    core::{ApiResource, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{watcher::{self, Event}, WatchStreamExt},
    Client,
};
use metrics::counter;
use relctl_core::{Delta, Release};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Client built from the ambient kubeconfig / in-cluster config.
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client")
}

/// GVK of a manifest's `apiVersion` + `kind`.
pub fn gvk_of(api_version: &str, kind: &str) -> GroupVersionKind {
    match api_version.split_once('/') {
        Some((g, v)) => GroupVersionKind { group: g.to_string(), version: v.to_string(), kind: kind.to_string() },
        None => GroupVersionKind { group: String::new(), version: api_version.to_string(), kind: kind.to_string() },
    }
}

/// Resolve the API resource for a GVK and whether it is namespaced.
pub fn find_api_resource(discovery: &Discovery, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

pub async fn run_discovery(client: Client) -> Result<Discovery> {
    Discovery::new(client).run().await.context("running API discovery")
}

pub fn release_api(client: Client, namespace: Option<&str>) -> Api<Release> {
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// List+watch releases and forward deltas. Watch errors are retried with
/// backoff; returns when the receiving side goes away.
pub async fn start_watcher(client: Client, namespace: Option<&str>, delta_tx: mpsc::Sender<Delta>) -> Result<()> {
    let api = release_api(client, namespace);
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(ns = ?namespace, "release watcher started");
    while let Some(ev) = stream.next().await {
        let delta = match ev {
            Ok(Event::Applied(o)) => {
                counter!("relctl_watch_events_total", 1u64, "kind" => "applied");
                Delta::Applied(o)
            }
            Ok(Event::Deleted(o)) => {
                counter!("relctl_watch_events_total", 1u64, "kind" => "deleted");
                Delta::Deleted(o)
            }
            Ok(Event::Restarted(list)) => {
                debug!(count = list.len(), "watch restart");
                counter!("relctl_watch_events_total", 1u64, "kind" => "restarted");
                Delta::Restarted(list)
            }
            Err(e) => {
                counter!("relctl_watch_errors_total", 1u64);
                warn!(error = %e, "release watch error; retrying");
                continue;
            }
        };
        if delta_tx.send(delta).await.is_err() {
            debug!("delta receiver closed; stopping watcher");
            return Ok(());
        }
    }
    warn!("release watcher stream ended");
    Ok(())
}

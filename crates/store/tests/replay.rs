#![forbid(unsafe_code)]

use relctl_core::{Delta, Release, ReleaseKey, ReleaseSpec};
use relctl_store::{CacheBuilder, DeletedRelease, Notification};

fn rel(ns: &str, name: &str, manifests: &str) -> Release {
    let mut r = Release::new(name, ReleaseSpec { manifests: manifests.into(), ..Default::default() });
    r.metadata.namespace = Some(ns.into());
    r
}

fn kinds(notes: &[Notification]) -> Vec<String> {
    notes
        .iter()
        .map(|n| match n {
            Notification::Add(o) => format!("+{}", ReleaseKey::for_release(o).unwrap()),
            Notification::Update { new, .. } => format!("~{}", ReleaseKey::for_release(new).unwrap()),
            Notification::Delete(DeletedRelease::Final(o)) => format!("-{}", ReleaseKey::for_release(o).unwrap()),
            Notification::Delete(DeletedRelease::Tombstone { key, .. }) => format!("!{}", key),
        })
        .collect()
}

#[test]
fn replay_basic_sequence() {
    let mut cb = CacheBuilder::new();
    assert!(!cb.synced());

    let n = cb.apply(Delta::Restarted(vec![rel("ns", "a", "x"), rel("ns", "b", "y")]));
    assert_eq!(kinds(&n), vec!["+ns/a", "+ns/b"]);
    assert!(cb.synced());

    let n = cb.apply(Delta::Applied(rel("ns", "a", "x2")));
    assert_eq!(kinds(&n), vec!["~ns/a"]);

    let n = cb.apply(Delta::Deleted(rel("ns", "b", "y")));
    assert_eq!(kinds(&n), vec!["-ns/b"]);

    let snap = cb.freeze();
    assert_eq!(snap.epoch, 3);
    assert_eq!(snap.items.len(), 1);
    assert_eq!(snap.items[&ReleaseKey::new("ns", "a")].spec.manifests, "x2");
}

#[test]
fn relist_turns_missing_objects_into_tombstones() {
    let mut cb = CacheBuilder::new();
    cb.apply(Delta::Restarted(vec![rel("ns", "a", "x"), rel("ns", "b", "y"), rel("ns", "c", "z")]));

    // Watch reconnects after `b` and `c` were removed while we were away.
    let n = cb.apply(Delta::Restarted(vec![rel("ns", "a", "x")]));
    assert_eq!(kinds(&n), vec!["~ns/a", "!ns/b", "!ns/c"]);
    match &n[1] {
        Notification::Delete(DeletedRelease::Tombstone { last_known, .. }) => {
            assert_eq!(last_known.spec.manifests, "y");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(cb.freeze().items.len(), 1);
}

#[test]
fn keyless_objects_are_notified_but_not_cached() {
    let mut cb = CacheBuilder::new();
    let orphan = Release::new("no-ns", ReleaseSpec::default());
    let n = cb.apply(Delta::Applied(orphan));
    assert_eq!(n.len(), 1);
    assert!(matches!(n[0], Notification::Add(_)));
    assert!(cb.freeze().items.is_empty());
}

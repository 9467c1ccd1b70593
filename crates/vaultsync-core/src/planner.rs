//! Three-way diff of two manifests against the last agreed baseline.

use crate::manifest::Manifest;
use crate::snapshot::SnapshotEntry;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Upload,
    Download,
    Conflict,
    Skip,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncAction {
    pub path: String,
    pub action: ActionKind,
    pub local_hash: Option<String>,
    pub remote_hash: Option<String>,
    pub base_hash: Option<String>,
}

/// Actions partitioned by kind, each list sorted by path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub uploads: Vec<SyncAction>,
    pub downloads: Vec<SyncAction>,
    pub deletes: Vec<SyncAction>,
    pub conflicts: Vec<SyncAction>,
}

impl SyncPlan {
    pub fn len(&self) -> usize {
        self.uploads.len() + self.downloads.len() + self.deletes.len() + self.conflicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanOptions {
    /// Treat "unchanged here, gone there" as a deletion to apply locally
    /// instead of re-transferring the file.
    pub detect_deletions: bool,
}

/// Decide what to do with one path given its hash on each side and in the
/// baseline. `None` means absent.
pub fn classify(
    local: Option<&str>,
    remote: Option<&str>,
    base: Option<&str>,
    options: PlanOptions,
) -> ActionKind {
    if local == remote {
        return ActionKind::Skip;
    }

    let Some(base) = base else {
        return match (local, remote) {
            (Some(_), None) => ActionKind::Upload,
            (None, Some(_)) => ActionKind::Download,
            // Created independently on both sides; no common ancestor.
            _ => ActionKind::Conflict,
        };
    };

    if options.detect_deletions {
        if remote.is_none() && local == Some(base) {
            return ActionKind::Delete;
        }
        if local.is_none() && remote == Some(base) {
            // Deleted here; the peer applies it on its own run.
            return ActionKind::Skip;
        }
    }

    if local == Some(base) {
        ActionKind::Download
    } else if remote == Some(base) {
        ActionKind::Upload
    } else {
        ActionKind::Conflict
    }
}

pub fn plan(
    local: &Manifest,
    remote: &Manifest,
    baseline: &BTreeMap<String, SnapshotEntry>,
) -> SyncPlan {
    plan_with(local, remote, baseline, PlanOptions::default())
}

pub fn plan_with(
    local: &Manifest,
    remote: &Manifest,
    baseline: &BTreeMap<String, SnapshotEntry>,
    options: PlanOptions,
) -> SyncPlan {
    let paths: BTreeSet<&String> = local.files.keys().chain(remote.files.keys()).collect();
    let mut out = SyncPlan::default();

    for path in paths {
        let local_hash = local.hash_of(path);
        let remote_hash = remote.hash_of(path);
        let base_hash = baseline.get(path.as_str()).map(|e| e.last_synced_hash.as_str());

        let kind = classify(local_hash, remote_hash, base_hash, options);
        let action = SyncAction {
            path: path.clone(),
            action: kind,
            local_hash: local_hash.map(str::to_string),
            remote_hash: remote_hash.map(str::to_string),
            base_hash: base_hash.map(str::to_string),
        };

        match kind {
            ActionKind::Upload => out.uploads.push(action),
            ActionKind::Download => out.downloads.push(action),
            ActionKind::Conflict => out.conflicts.push(action),
            ActionKind::Delete => out.deletes.push(action),
            ActionKind::Skip => {}
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn manifest(device: &str, files: &[(&str, &str)]) -> Manifest {
        Manifest {
            vault_id: "v".into(),
            device_id: device.into(),
            generated_at: 0,
            files: files
                .iter()
                .map(|(p, h)| (p.to_string(), h.to_string()))
                .collect(),
        }
    }

    fn baseline(files: &[(&str, &str)]) -> BTreeMap<String, SnapshotEntry> {
        files
            .iter()
            .map(|(p, h)| (p.to_string(), SnapshotEntry::agreed(h, "me")))
            .collect()
    }

    #[test]
    fn test_identical_files_need_nothing() {
        let plan = plan(
            &manifest("l", &[("a.md", "h1")]),
            &manifest("r", &[("a.md", "h1")]),
            &baseline(&[]),
        );
        assert!(plan.is_empty());
    }

    #[test]
    fn test_new_local_file_uploads() {
        let plan = plan(
            &manifest("l", &[("a.md", "h1")]),
            &manifest("r", &[]),
            &baseline(&[]),
        );
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.uploads[0].path, "a.md");
        assert_eq!(plan.uploads[0].action, ActionKind::Upload);
    }

    #[test]
    fn test_new_remote_file_downloads() {
        let plan = plan(
            &manifest("l", &[]),
            &manifest("r", &[("a.md", "h1")]),
            &baseline(&[]),
        );
        assert_eq!(plan.downloads.len(), 1);
        assert_eq!(plan.downloads[0].remote_hash.as_deref(), Some("h1"));
    }

    #[test]
    fn test_independent_creation_conflicts() {
        let plan = plan(
            &manifest("l", &[("a.md", "h1")]),
            &manifest("r", &[("a.md", "h2")]),
            &baseline(&[]),
        );
        assert_eq!(plan.conflicts.len(), 1);
        assert_eq!(plan.conflicts[0].base_hash, None);
    }

    #[test]
    fn test_remote_advanced_downloads() {
        let plan = plan(
            &manifest("l", &[("a.md", "h1")]),
            &manifest("r", &[("a.md", "h2")]),
            &baseline(&[("a.md", "h1")]),
        );
        assert_eq!(plan.downloads.len(), 1);
        assert!(plan.uploads.is_empty() && plan.conflicts.is_empty());
    }

    #[test]
    fn test_local_advanced_uploads() {
        let plan = plan(
            &manifest("l", &[("a.md", "h2")]),
            &manifest("r", &[("a.md", "h1")]),
            &baseline(&[("a.md", "h1")]),
        );
        assert_eq!(plan.uploads.len(), 1);
    }

    #[test]
    fn test_both_advanced_conflicts() {
        let plan = plan(
            &manifest("l", &[("a.md", "h2")]),
            &manifest("r", &[("a.md", "h3")]),
            &baseline(&[("a.md", "h1")]),
        );
        assert_eq!(plan.len(), 1);
        let action = &plan.conflicts[0];
        assert_eq!(action.path, "a.md");
        assert_eq!(action.local_hash.as_deref(), Some("h2"));
        assert_eq!(action.remote_hash.as_deref(), Some("h3"));
        assert_eq!(action.base_hash.as_deref(), Some("h1"));
    }

    #[test]
    fn test_deletes_stay_empty_by_default() {
        let plan = plan(
            &manifest("l", &[("a.md", "h1")]),
            &manifest("r", &[]),
            &baseline(&[("a.md", "h1")]),
        );
        assert!(plan.deletes.is_empty());
        assert_eq!(plan.downloads.len(), 1);
    }

    #[test]
    fn test_deletion_detection_when_enabled() {
        let opts = PlanOptions {
            detect_deletions: true,
        };
        let base = baseline(&[("gone-there.md", "h1"), ("gone-here.md", "h2"), ("edited.md", "h3")]);
        let plan = plan_with(
            &manifest("l", &[("gone-there.md", "h1"), ("edited.md", "h4")]),
            &manifest("r", &[("gone-here.md", "h2")]),
            &base,
            opts,
        );

        assert_eq!(plan.deletes.len(), 1);
        assert_eq!(plan.deletes[0].path, "gone-there.md");
        // Edited locally, deleted remotely: still needs a human.
        assert_eq!(plan.conflicts.len(), 1);
        assert_eq!(plan.conflicts[0].path, "edited.md");
        assert!(plan.uploads.is_empty() && plan.downloads.is_empty());
    }

    fn arb_side() -> impl Strategy<Value = Vec<(String, String)>> {
        prop::collection::vec(("[a-e]\\.md", "h[0-3]"), 0..6)
    }

    fn to_manifest(entries: &[(String, String)]) -> Manifest {
        Manifest {
            vault_id: "v".into(),
            device_id: "d".into(),
            generated_at: 0,
            files: entries.iter().cloned().collect(),
        }
    }

    fn base_map(base: &[(String, String)]) -> BTreeMap<String, SnapshotEntry> {
        base.iter()
            .map(|(p, h)| (p.clone(), SnapshotEntry::agreed(h, "me")))
            .collect()
    }

    /// Three sides plus every path they mention, in a random order.
    fn arb_sides_and_shuffled_paths() -> impl Strategy<
        Value = (
            Vec<(String, String)>,
            Vec<(String, String)>,
            Vec<(String, String)>,
            Vec<String>,
        ),
    > {
        (arb_side(), arb_side(), arb_side()).prop_flat_map(|(local, remote, base)| {
            let union: BTreeSet<String> = local
                .iter()
                .chain(&remote)
                .map(|(p, _)| p.clone())
                .collect();
            let paths = Just(union.into_iter().collect::<Vec<_>>()).prop_shuffle();
            (Just(local), Just(remote), Just(base), paths)
        })
    }

    proptest! {
        #[test]
        fn test_plan_matches_per_path_classification_in_any_order(
            (local, remote, base, shuffled) in arb_sides_and_shuffled_paths(),
        ) {
            let l = to_manifest(&local);
            let r = to_manifest(&remote);
            let base_map = base_map(&base);

            let mut expected = SyncPlan::default();
            for path in &shuffled {
                let local_hash = l.hash_of(path);
                let remote_hash = r.hash_of(path);
                let base_hash = base_map.get(path).map(|e| e.last_synced_hash.as_str());
                let action = SyncAction {
                    path: path.clone(),
                    action: classify(local_hash, remote_hash, base_hash, PlanOptions::default()),
                    local_hash: local_hash.map(str::to_string),
                    remote_hash: remote_hash.map(str::to_string),
                    base_hash: base_hash.map(str::to_string),
                };
                match action.action {
                    ActionKind::Upload => expected.uploads.push(action),
                    ActionKind::Download => expected.downloads.push(action),
                    ActionKind::Conflict => expected.conflicts.push(action),
                    ActionKind::Delete => expected.deletes.push(action),
                    ActionKind::Skip => {}
                }
            }
            for list in [
                &mut expected.uploads,
                &mut expected.downloads,
                &mut expected.conflicts,
                &mut expected.deletes,
            ] {
                list.sort_by(|a, b| a.path.cmp(&b.path));
            }

            let first = plan(&l, &r, &base_map);
            prop_assert_eq!(&first, &expected);
            prop_assert_eq!(&first, &plan(&l, &r, &base_map));
        }

        #[test]
        fn test_equal_hashes_never_produce_actions(
            local in arb_side(),
            remote in arb_side(),
            base in arb_side(),
        ) {
            let l = to_manifest(&local);
            let r = to_manifest(&remote);
            let base_map = base_map(&base);

            let result = plan(&l, &r, &base_map);
            let all = result
                .uploads
                .iter()
                .chain(&result.downloads)
                .chain(&result.conflicts)
                .chain(&result.deletes);
            for action in all {
                prop_assert_ne!(l.hash_of(&action.path), r.hash_of(&action.path));
            }
        }

        #[test]
        fn test_every_differing_path_is_classified_once(
            local in arb_side(),
            remote in arb_side(),
            base in arb_side(),
        ) {
            let l = to_manifest(&local);
            let r = to_manifest(&remote);
            let base_map = base_map(&base);

            let result = plan(&l, &r, &base_map);
            let differing = l
                .files
                .keys()
                .chain(r.files.keys())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .filter(|p| l.hash_of(p) != r.hash_of(p))
                .count();
            prop_assert_eq!(result.len(), differing);
            prop_assert!(result.deletes.is_empty());
        }
    }
}

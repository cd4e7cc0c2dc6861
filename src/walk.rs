//! Depth-bounded tree partitioning.
//!
//! A replication run splits the source tree into independent work units.
//! Directories strictly above the cut-off depth become non-recursive units
//! (their immediate contents only); directories exactly at the cut-off depth
//! own their whole subtree and become recursive units. Excluded and symlinked
//! directories are never descended into.

use anyhow::{anyhow, bail, Context};
use std::collections::{BTreeMap, VecDeque};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// One partitioned subtree, assigned to exactly one transfer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkUnit {
    pub path: PathBuf,
    pub recursive: bool,
}

impl WorkUnit {
    pub fn new(path: impl Into<PathBuf>, recursive: bool) -> Self {
        WorkUnit {
            path: path.into(),
            recursive,
        }
    }

    /// Serialize as a single queue token: `"{0|1}_{path}"`.
    pub fn encode(&self) -> String {
        format!("{}_{}", u8::from(self.recursive), self.path.display())
    }

    /// Decode a queue token produced by [`WorkUnit::encode`].
    pub fn decode(token: &str) -> anyhow::Result<Self> {
        let (flag, path) = token
            .split_once('_')
            .ok_or_else(|| anyhow!("malformed work unit token {token:?}"))?;
        let recursive = match flag {
            "0" => false,
            "1" => true,
            other => bail!("malformed work unit recursion flag {other:?} in {token:?}"),
        };
        if path.is_empty() {
            bail!("empty path in work unit token {token:?}");
        }
        Ok(WorkUnit::new(path, recursive))
    }
}

/// Exclusion rule: a path is excluded when it matches the regex and, if an
/// owner is configured, is additionally owned by that user.
#[derive(Debug, Default)]
pub struct WalkFilter {
    exclude: Option<regex::Regex>,
    owner_uid: Option<u32>,
}

impl WalkFilter {
    pub fn new(exclude_re: Option<&str>, exclude_user: Option<&str>) -> anyhow::Result<Self> {
        let exclude = exclude_re
            .map(regex::Regex::new)
            .transpose()
            .context("invalid exclusion regex")?;
        let owner_uid = match exclude_user {
            Some(name) => {
                let user = nix::unistd::User::from_name(name)
                    .with_context(|| format!("failed to look up user {name:?}"))?
                    .ok_or_else(|| anyhow!("no such user {name:?}"))?;
                Some(user.uid.as_raw())
            }
            None => None,
        };
        Ok(WalkFilter { exclude, owner_uid })
    }

    fn excludes(&self, path: &Path) -> anyhow::Result<bool> {
        let Some(exclude) = &self.exclude else {
            return Ok(false);
        };
        if !exclude.is_match(&path.to_string_lossy()) {
            return Ok(false);
        }
        match self.owner_uid {
            // owner-scoped: the match only counts for paths owned by the user
            Some(uid) => {
                let md = std::fs::symlink_metadata(path)
                    .with_context(|| format!("failed to stat {}", path.display()))?;
                Ok(md.uid() == uid)
            }
            None => Ok(true),
        }
    }
}

fn component_depth(path: &Path) -> usize {
    path.components().count()
}

/// Partition the tree under `root` down to `depth` levels.
///
/// The returned set contains `root` itself and every directory down to
/// `depth` levels below it; exactly the directories at relative depth
/// `depth` are recursive. `depth == 0` yields a single recursive unit for
/// the whole tree.
pub fn build_paths(root: &Path, depth: u32, filter: &WalkFilter) -> anyhow::Result<Vec<WorkUnit>> {
    let root = root.to_path_buf();
    if depth == 0 {
        return Ok(vec![WorkUnit::new(root, true)]);
    }
    if !root.is_dir() {
        bail!("base path {} is not a directory", root.display());
    }
    let mut units = vec![WorkUnit::new(root.clone(), false)];
    let mut pending = VecDeque::from([(root, 0u32)]);
    while let Some((dir, level)) = pending.pop_front() {
        if filter.excludes(&dir)? {
            tracing::info!("excluding path {}", dir.display());
            continue;
        }
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("failed to read directory {}", dir.display()))?;
        for entry in entries {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if !file_type.is_dir() {
                if file_type.is_symlink() && entry.path().is_dir() {
                    // never descend into or emit symlinked directories
                    tracing::info!("directory symlink not added {}", entry.path().display());
                }
                continue;
            }
            let subpath = entry.path();
            if filter.excludes(&subpath)? {
                tracing::info!("excluding path {}", subpath.display());
                continue;
            }
            let sublevel = level + 1;
            units.push(WorkUnit::new(subpath.clone(), sublevel == depth));
            if sublevel < depth {
                pending.push_back((subpath, sublevel));
            }
        }
    }
    tracing::info!(
        "partition of {} contains {} entries",
        units[0].path.display(),
        units.len()
    );
    Ok(units)
}

/// Partition `root` at `depth` and re-partition override subpaths deeper.
///
/// Each override is a `{extra_depth}_{subpath}` token; the subpath must
/// already be present in the partition built so far, and overrides must be
/// supplied in non-decreasing resulting-depth order. Violations are
/// configuration errors.
pub fn get_pathlist(
    root: &Path,
    depth: u32,
    filter: &WalkFilter,
    overrides: &[String],
) -> anyhow::Result<Vec<WorkUnit>> {
    let base = build_paths(root, depth, filter)?;
    if overrides.is_empty() {
        return Ok(base);
    }
    let mut partition: BTreeMap<PathBuf, bool> =
        base.into_iter().map(|u| (u.path, u.recursive)).collect();
    let mut depth_level = component_depth(root) + depth as usize;
    for token in overrides {
        let (extra, subpath) = token
            .split_once('_')
            .ok_or_else(|| anyhow!("malformed subpath override {token:?}"))?;
        let extra: u32 = extra
            .parse()
            .with_context(|| format!("malformed subpath override {token:?}"))?;
        let subpath = if Path::new(subpath).starts_with(root) {
            PathBuf::from(subpath)
        } else {
            root.join(subpath.trim_start_matches('/'))
        };
        if !partition.contains_key(&subpath) {
            bail!(
                "{} is not in the partition of {} at depth {}",
                subpath.display(),
                root.display(),
                depth
            );
        }
        let new_level = component_depth(&subpath) + extra as usize;
        // deepest subpaths must be specified last; this keeps the merge single-pass
        if new_level < depth_level {
            bail!(
                "override depth {} for subpath {} is shallower than current depth level {}",
                new_level,
                subpath.display(),
                depth_level
            );
        }
        depth_level = new_level;
        for unit in build_paths(&subpath, extra, filter)? {
            partition.insert(unit.path, unit.recursive);
        }
    }
    Ok(partition
        .into_iter()
        .map(|(path, recursive)| WorkUnit { path, recursive })
        .collect())
}

/// Encode a partition into queue tokens.
pub fn encode_paths(units: &[WorkUnit]) -> Vec<String> {
    units.iter().map(WorkUnit::encode).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    // root/{a1,b1,c1}, a1/{aa2,ab2,ac2}, b1/{ba2,bb2}, a1/ab2/aa3,
    // each directory with a .snapshots child and a regular file
    fn setup_tree() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = [
            "a1", "b1", "c1", "a1/aa2", "a1/ab2", "a1/ac2", "b1/ba2", "b1/bb2", "a1/ab2/aa3",
        ];
        for dir in dirs {
            let path = tmp.path().join(dir);
            std::fs::create_dir(&path).unwrap();
            std::fs::create_dir(path.join(".snapshots")).unwrap();
            std::fs::write(path.join("foofile"), b"").unwrap();
        }
        tmp
    }

    fn relative(units: Vec<WorkUnit>, root: &Path) -> BTreeSet<(String, bool)> {
        units
            .into_iter()
            .map(|u| {
                let rel = u.path.strip_prefix(root).unwrap();
                (format!("/tree/{}", rel.display()), u.recursive)
            })
            .collect()
    }

    #[test]
    fn depth_zero_is_one_recursive_unit() {
        let tmp = setup_tree();
        let filter = WalkFilter::default();
        let units = build_paths(tmp.path(), 0, &filter).unwrap();
        assert_eq!(units, vec![WorkUnit::new(tmp.path(), true)]);
    }

    #[test]
    fn partition_with_exclusion() {
        let tmp = setup_tree();
        let filter = WalkFilter::new(Some(r"/\.snapshots(/.*|$)"), None).unwrap();
        let mut units = get_pathlist(tmp.path(), 3, &filter, &[]).unwrap();
        let root_unit = WorkUnit::new(tmp.path(), false);
        assert!(units.contains(&root_unit));
        units.retain(|u| u.path != tmp.path());
        let got = relative(units, tmp.path());
        let expected: BTreeSet<(String, bool)> = [
            ("/tree/a1", false),
            ("/tree/b1", false),
            ("/tree/c1", false),
            ("/tree/a1/aa2", false),
            ("/tree/a1/ab2", false),
            ("/tree/a1/ac2", false),
            ("/tree/b1/ba2", false),
            ("/tree/b1/bb2", false),
            ("/tree/a1/ab2/aa3", true),
        ]
        .into_iter()
        .map(|(p, r)| (p.to_string(), r))
        .collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn symlinked_directories_are_skipped() {
        let tmp = setup_tree();
        std::os::unix::fs::symlink(tmp.path().join("a1"), tmp.path().join("link1")).unwrap();
        let filter = WalkFilter::default();
        let units = build_paths(tmp.path(), 2, &filter).unwrap();
        assert!(units.iter().all(|u| !u.path.ends_with("link1")));
    }

    #[test]
    fn only_cutoff_depth_is_recursive() {
        let tmp = setup_tree();
        let filter = WalkFilter::new(Some(r"/\.snapshots(/.*|$)"), None).unwrap();
        let units = build_paths(tmp.path(), 2, &filter).unwrap();
        for unit in &units {
            let depth = unit.path.strip_prefix(tmp.path()).unwrap().components().count();
            assert_eq!(unit.recursive, depth == 2, "unit {unit:?}");
        }
    }

    #[test]
    fn overrides_deepen_the_partition() {
        let tmp = setup_tree();
        let filter = WalkFilter::new(Some(r"/\.snapshots(/.*|$)"), None).unwrap();
        let overrides = vec!["2_a1".to_string()];
        let units = get_pathlist(tmp.path(), 1, &filter, &overrides).unwrap();
        let got = relative(
            units.into_iter().filter(|u| u.path != tmp.path()).collect(),
            tmp.path(),
        );
        // a1 was re-partitioned two levels deep; b1 and c1 stay recursive at depth 1
        assert!(got.contains(&("/tree/b1".to_string(), true)));
        assert!(got.contains(&("/tree/c1".to_string(), true)));
        assert!(got.contains(&("/tree/a1".to_string(), false)));
        assert!(got.contains(&("/tree/a1/ab2".to_string(), false)));
        assert!(got.contains(&("/tree/a1/ab2/aa3".to_string(), true)));
    }

    #[test]
    fn out_of_order_overrides_are_rejected() {
        let tmp = setup_tree();
        let filter = WalkFilter::default();
        let in_order = vec!["1_a1".to_string(), "2_b1".to_string()];
        assert!(get_pathlist(tmp.path(), 1, &filter, &in_order).is_ok());
        let out_of_order = vec!["2_a1".to_string(), "1_b1".to_string()];
        assert!(get_pathlist(tmp.path(), 1, &filter, &out_of_order).is_err());
    }

    #[test]
    fn override_must_exist_in_partition() {
        let tmp = setup_tree();
        let filter = WalkFilter::default();
        let overrides = vec!["1_nonexistent".to_string()];
        assert!(get_pathlist(tmp.path(), 1, &filter, &overrides).is_err());
    }

    #[test]
    fn encode_matches_wire_format() {
        let units = [
            WorkUnit::new("/tree/c1", false),
            WorkUnit::new("/tree/b1/bb2/.snapshots", true),
        ];
        assert_eq!(
            encode_paths(&units),
            vec!["0_/tree/c1", "1_/tree/b1/bb2/.snapshots"]
        );
    }

    #[test]
    fn decode_round_trip() {
        for unit in [
            WorkUnit::new("/tree/c1", false),
            WorkUnit::new("/tree/b1/bb2/.snapshots", true),
            WorkUnit::new("/with_underscore/dir_name", true),
        ] {
            assert_eq!(WorkUnit::decode(&unit.encode()).unwrap(), unit);
        }
        assert!(WorkUnit::decode("2_/bad/flag").is_err());
        assert!(WorkUnit::decode("no-separator").is_err());
        assert!(WorkUnit::decode("1_").is_err());
    }
}

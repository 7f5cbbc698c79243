//! Output capture: splitting the install tree into artifact tarballs.

use crate::{Error, Result};
use morph_morphology::SplitRule;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Assign every file under `destdir` to an artifact.
///
/// Rules apply in declaration order, first match wins, matched against the
/// install-root-relative path (no leading slash). Files matching no rule go
/// to `catch_all`. The returned map is keyed by artifact name; paths are
/// sorted for deterministic tarballs.
pub fn split_install_tree(
    destdir: &Path,
    rules: &[SplitRule],
    catch_all: &str,
) -> Result<BTreeMap<String, Vec<PathBuf>>> {
    let compiled: Vec<(String, Vec<regex::Regex>)> = rules
        .iter()
        .map(|rule| {
            rule.compile()
                .map(|patterns| (rule.artifact.clone(), patterns))
                .map_err(|e| Error::staging("compile split rule", std::io::Error::other(e)))
        })
        .collect::<Result<_>>()?;

    let mut files = Vec::new();
    collect_files(destdir, destdir, &mut files)?;
    files.sort();

    let mut splits: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for rule in rules {
        splits.entry(rule.artifact.clone()).or_default();
    }
    splits.entry(catch_all.to_string()).or_default();

    for relative in files {
        let text = relative.to_string_lossy();
        let artifact = compiled
            .iter()
            .find(|(_, patterns)| patterns.iter().any(|p| p.is_match(&text)))
            .map_or(catch_all, |(name, _)| name.as_str());
        splits
            .get_mut(artifact)
            .unwrap_or_else(|| unreachable!("all artifacts pre-seeded"))
            .push(relative);
    }
    Ok(splits)
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries =
        std::fs::read_dir(dir).map_err(|e| Error::staging("read install tree", e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::staging("read install tree entry", e))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .map_err(|e| Error::staging("stat install tree entry", e))?;
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else {
            let relative = path
                .strip_prefix(root)
                .map_err(|e| Error::staging("relativise path", std::io::Error::other(e)))?;
            out.push(relative.to_path_buf());
        }
    }
    Ok(())
}

/// Tar the given install-root-relative files into `output`.
///
/// Entries are appended in the given (sorted) order; symlinks are preserved.
pub fn write_artifact_tar(destdir: &Path, files: &[PathBuf], output: &Path) -> Result<()> {
    let file = std::fs::File::create(output)
        .map_err(|e| Error::staging("create artifact tar", e))?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);
    for relative in files {
        let full = destdir.join(relative);
        builder
            .append_path_with_name(&full, relative)
            .map_err(|e| Error::staging("append to artifact tar", e))?;
    }
    let mut file = builder
        .into_inner()
        .map_err(|e| Error::staging("finish artifact tar", e))?;
    use std::io::Write as _;
    file.flush()
        .map_err(|e| Error::staging("flush artifact tar", e))?;
    debug!(output = %output.display(), files = files.len(), "Wrote artifact tar");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(root: &Path, relative: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
    }

    #[test]
    fn first_match_wins_and_rest_goes_to_catch_all() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "usr/include/z.h");
        touch(tmp.path(), "usr/lib/libz.so");
        touch(tmp.path(), "usr/share/doc/README");

        let rules = vec![
            SplitRule {
                artifact: "z-devel".into(),
                include: vec!["usr/include/.*".into()],
            },
            SplitRule {
                artifact: "z-runtime".into(),
                include: vec!["usr/lib/.*".into(), "usr/include/.*".into()],
            },
        ];
        let splits = split_install_tree(tmp.path(), &rules, "z-misc").unwrap();

        assert_eq!(splits["z-devel"], [PathBuf::from("usr/include/z.h")]);
        assert_eq!(splits["z-runtime"], [PathBuf::from("usr/lib/libz.so")]);
        assert_eq!(splits["z-misc"], [PathBuf::from("usr/share/doc/README")]);
    }

    #[test]
    fn no_rules_means_everything_in_catch_all() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "usr/bin/hello");
        let splits = split_install_tree(tmp.path(), &[], "hello").unwrap();
        assert_eq!(splits.len(), 1);
        assert_eq!(splits["hello"], [PathBuf::from("usr/bin/hello")]);
    }

    #[test]
    fn empty_splits_are_represented() {
        let tmp = TempDir::new().unwrap();
        let rules = vec![SplitRule {
            artifact: "x-devel".into(),
            include: vec!["usr/include/.*".into()],
        }];
        let splits = split_install_tree(tmp.path(), &rules, "x-misc").unwrap();
        assert!(splits["x-devel"].is_empty());
        assert!(splits["x-misc"].is_empty());
    }

    #[test]
    fn tar_round_trips() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "usr/bin/hello");
        let splits = split_install_tree(tmp.path(), &[], "hello").unwrap();

        let out_dir = TempDir::new().unwrap();
        let tar_path = out_dir.path().join("hello.tar");
        write_artifact_tar(tmp.path(), &splits["hello"], &tar_path).unwrap();

        let unpack = TempDir::new().unwrap();
        tar::Archive::new(std::fs::File::open(&tar_path).unwrap())
            .unpack(unpack.path())
            .unwrap();
        assert!(unpack.path().join("usr/bin/hello").exists());
    }
}

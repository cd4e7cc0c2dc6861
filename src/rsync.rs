//! Transfer tool invocation.
//!
//! Builds rsync command lines from configuration, generates the per-unit
//! files-from manifest and the per-session daemon config artifact, runs the
//! subprocess and parses its textual statistics output. The transfer tool
//! itself is opaque: exit code 0 is success, everything else is a transient
//! failure handled by the dispatch retry loop.

use anyhow::{bail, Context};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::RsyncOptions;
use crate::stats;
use crate::walk::WorkUnit;

/// Scratch directory for generated manifests and daemon configs.
const WORK_DIR: &str = "zkmirror";

/// Result of one transfer subprocess run.
#[derive(Debug)]
pub struct TransferOutcome {
    pub success: bool,
    /// Combined stdout and stderr.
    pub output: String,
}

fn work_dir() -> anyhow::Result<PathBuf> {
    let dir = std::env::temp_dir().join(WORK_DIR);
    std::fs::create_dir_all(&dir).context("failed to create scratch directory")?;
    Ok(dir)
}

/// Name of the daemon module exposed for one session.
pub fn module_name(session: &str) -> String {
    format!("zkm-{session}")
}

/// Write the daemon service definition: one module over the base path,
/// read-write. The returned handle owns the file; dropping it cleans up.
pub fn daemon_config(module: &str, base_path: &Path) -> anyhow::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::NamedTempFile::new_in(work_dir()?)
        .context("failed to create daemon config file")?;
    writeln!(file, "[{module}]")?;
    writeln!(file, "path = {}", base_path.display())?;
    writeln!(file, "read only = no")?;
    writeln!(file, "uid = root")?;
    writeln!(file, "gid = root")?;
    file.flush()?;
    Ok(file)
}

/// Command line for the supervised transfer daemon.
pub fn daemon_command(config: &Path, port: u16, drop_cache: bool) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("rsync");
    cmd.arg("--daemon")
        .arg("--no-detach")
        .arg("--config")
        .arg(config)
        .arg("--port")
        .arg(port.to_string());
    if drop_cache {
        cmd.arg("--drop-cache");
    }
    cmd
}

pub struct RsyncInvoker {
    base_path: PathBuf,
    module: String,
    opts: RsyncOptions,
}

impl RsyncInvoker {
    pub fn new(base_path: &Path, session: &str, opts: RsyncOptions) -> Self {
        RsyncInvoker {
            base_path: base_path.to_path_buf(),
            module: module_name(session),
            opts,
        }
    }

    /// Write the files-from manifest holding the unit's relative subpath.
    fn manifest(&self, unit: &WorkUnit) -> anyhow::Result<tempfile::NamedTempFile> {
        let subpath = unit.path.strip_prefix(&self.base_path).with_context(|| {
            format!(
                "{} is not a subpath of {}",
                unit.path.display(),
                self.base_path.display()
            )
        })?;
        let mut file =
            tempfile::NamedTempFile::new_in(work_dir()?).context("failed to create manifest")?;
        writeln!(file, "{}/", subpath.display())?;
        file.flush()?;
        Ok(file)
    }

    /// Assemble the flag vector. Archive mode minus recursion (`-lptgoD`);
    /// recursion is decided per unit. Passthrough flags go last, unchecked.
    pub fn build_flags(&self, manifest: &Path, recursive: bool) -> Vec<String> {
        let mut flags = vec![
            "--stats".to_string(),
            "--numeric-ids".to_string(),
            "-lptgoD".to_string(),
            format!("--files-from={}", manifest.display()),
        ];
        if recursive {
            flags.push("-r".to_string());
        }
        if self.opts.delete {
            flags.push("--delete".to_string());
        }
        if self.opts.checksum {
            flags.push("--checksum".to_string());
        }
        if self.opts.drop_cache {
            flags.push("--drop-cache".to_string());
        }
        if self.opts.hard_links {
            flags.push("--hard-links".to_string());
        }
        if let Some(timeout) = self.opts.timeout {
            flags.push("--timeout".to_string());
            flags.push(timeout.to_string());
        }
        if self.opts.verbose {
            flags.push("--verbose".to_string());
        }
        if self.opts.dry_run {
            flags.push("-n".to_string());
        }
        if !self.opts.passthrough.is_empty() {
            let extra: Vec<String> = self
                .opts
                .passthrough
                .iter()
                .map(|opt| format!("--{}", opt.replacen(':', "=", 1)))
                .collect();
            tracing::warn!("adding unchecked flags {}", extra.join(" "));
            flags.extend(extra);
        }
        flags
    }

    pub fn verbose(&self) -> bool {
        self.opts.verbose
    }

    /// Run one transfer of `unit` against the daemon at `host:port`.
    pub async fn run_transfer(
        &self,
        unit: &WorkUnit,
        host: &str,
        port: u16,
    ) -> anyhow::Result<TransferOutcome> {
        let manifest = self.manifest(unit)?;
        let flags = self.build_flags(manifest.path(), unit.recursive);
        tracing::debug!("rsync flags: {}", flags.join(" "));
        let output = tokio::process::Command::new("rsync")
            .args(&flags)
            .arg(format!("{}/", self.base_path.display()))
            .arg(format!("rsync://{host}:{port}/{}", self.module))
            .output()
            .await
            .context("failed to run rsync")?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }
        Ok(TransferOutcome {
            success: output.status.success(),
            output: combined,
        })
    }
}

/// Split the verbose file listing (first blank-line-separated block) off the
/// statistics output.
pub fn split_verbose_listing(output: &str) -> (Option<String>, String) {
    match output.split_once("\n\n") {
        Some((listing, rest)) => (Some(listing.to_string()), rest.to_string()),
        None => (None, output.to_string()),
    }
}

/// Parse recognized `Label: value` statistic lines. Unrecognized lines and
/// unparsable values are dropped; they never fail a transfer.
pub fn parse_stats(output: &str) -> Vec<(&'static str, i64)> {
    let mut parsed = Vec::new();
    for line in output.lines() {
        let Some((label, rest)) = line.split_once(':') else {
            tracing::debug!("output line not parsed: {line}");
            continue;
        };
        let Some(name) = stats::recognize(label) else {
            tracing::debug!("output metric not recognised: {label}");
            continue;
        };
        let Some(token) = rest.split_whitespace().next() else {
            tracing::debug!("output line not parsed: {line}");
            continue;
        };
        match token.replace(',', "").parse::<i64>() {
            Ok(value) => parsed.push((name, value)),
            Err(_) => tracing::debug!("output value not parsed: {line}"),
        }
    }
    parsed
}

/// Validate a unit against the base path before dispatch.
pub fn unit_under_base(unit: &WorkUnit, base_path: &Path) -> anyhow::Result<()> {
    if !unit.path.starts_with(base_path) {
        bail!(
            "invalid work unit: {} is not a subpath of {}",
            unit.path.display(),
            base_path.display()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invoker(opts: RsyncOptions) -> RsyncInvoker {
        RsyncInvoker::new(Path::new("/data/tree"), "run1", opts)
    }

    #[test]
    fn base_flags_always_present() {
        let flags = invoker(RsyncOptions::default()).build_flags(Path::new("/tmp/m"), false);
        assert_eq!(
            flags,
            vec!["--stats", "--numeric-ids", "-lptgoD", "--files-from=/tmp/m"]
        );
    }

    #[test]
    fn recursion_is_per_unit() {
        let flags = invoker(RsyncOptions::default()).build_flags(Path::new("/tmp/m"), true);
        assert!(flags.contains(&"-r".to_string()));
    }

    #[test]
    fn optional_flags_follow_configuration() {
        let opts = RsyncOptions {
            dry_run: true,
            delete: true,
            checksum: true,
            hard_links: true,
            verbose: true,
            drop_cache: true,
            timeout: Some(300),
            passthrough: vec![],
        };
        let flags = invoker(opts).build_flags(Path::new("/tmp/m"), false);
        for expected in [
            "--delete",
            "--checksum",
            "--drop-cache",
            "--hard-links",
            "--timeout",
            "300",
            "--verbose",
            "-n",
        ] {
            assert!(flags.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn passthrough_flags_go_last_unchecked() {
        let opts = RsyncOptions {
            passthrough: vec!["bwlimit:1000".to_string(), "compress".to_string()],
            ..RsyncOptions::default()
        };
        let flags = invoker(opts).build_flags(Path::new("/tmp/m"), false);
        let n = flags.len();
        assert_eq!(flags[n - 2], "--bwlimit=1000");
        assert_eq!(flags[n - 1], "--compress");
    }

    #[test]
    fn stats_parsing_normalizes_labels_and_commas() {
        let output = "Number of files: 1,024 (reg: 1,000, dir: 24)\n\
                      Total file size: 104,857,600 bytes\n\
                      sent 1234 bytes  received 35 bytes\n\
                      Total bytes sent: 1,234\n";
        let parsed = parse_stats(output);
        assert_eq!(
            parsed,
            vec![
                ("Number_of_files", 1024),
                ("Total_file_size", 104_857_600),
                ("Total_bytes_sent", 1234),
            ]
        );
    }

    #[test]
    fn unparsable_lines_are_dropped() {
        let output = "Number of files: lots\ngarbage line\nTotal file size:\n";
        assert!(parse_stats(output).is_empty());
    }

    #[test]
    fn verbose_listing_is_split_off() {
        let output = "file one\nfile two\n\nNumber of files: 2\n";
        let (listing, rest) = split_verbose_listing(output);
        assert_eq!(listing.unwrap(), "file one\nfile two");
        assert_eq!(parse_stats(&rest), vec![("Number_of_files", 2)]);
    }

    #[test]
    fn manifest_holds_relative_subpath() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("tree");
        std::fs::create_dir_all(base.join("a1/ab2")).unwrap();
        let invoker = RsyncInvoker::new(&base, "run1", RsyncOptions::default());
        let unit = WorkUnit::new(base.join("a1/ab2"), true);
        let manifest = invoker.manifest(&unit).unwrap();
        let contents = std::fs::read_to_string(manifest.path()).unwrap();
        assert_eq!(contents, "a1/ab2/\n");
    }

    #[test]
    fn manifest_rejects_foreign_paths() {
        let invoker = invoker(RsyncOptions::default());
        let unit = WorkUnit::new("/elsewhere/x", false);
        assert!(invoker.manifest(&unit).is_err());
    }

    #[test]
    fn daemon_config_exposes_module_read_write() {
        let module = module_name("run1");
        let config = daemon_config(&module, Path::new("/data/tree")).unwrap();
        let contents = std::fs::read_to_string(config.path()).unwrap();
        assert!(contents.starts_with("[zkm-run1]\n"));
        assert!(contents.contains("path = /data/tree\n"));
        assert!(contents.contains("read only = no\n"));
    }
}

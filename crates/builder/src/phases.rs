//! Phase execution: running chunk build commands with a captured log.

use crate::{Error, Result};
use morph_graph::BuildUnit;
use morph_morphology::Phase;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Run every phase of `unit` in canonical order.
///
/// Commands run under `sh -c` in `cwd` with exactly the given environment.
/// stdout and stderr are merged into the log at `log_path` (and echoed when
/// `echo` is set). The first non-zero exit aborts the unit.
pub async fn run_phases(
    unit: &BuildUnit,
    env: &BTreeMap<String, String>,
    cwd: &Path,
    log_path: &Path,
    echo: bool,
) -> Result<()> {
    let mut log = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .await
        .map_err(|e| Error::staging("open build log", e))?;

    for phase in Phase::ALL {
        let commands = unit
            .phase_commands
            .get(&phase)
            .map_or(&[][..], Vec::as_slice);
        if commands.is_empty() {
            continue;
        }
        debug!(unit = %unit.artifact_name, %phase, commands = commands.len(), "Running phase");
        for command in commands {
            let header = format!("# {phase}: {command}\n");
            log.write_all(header.as_bytes())
                .await
                .map_err(|e| Error::staging("write build log", e))?;
            if echo {
                print!("{header}");
            }
            run_command(unit, phase, command, env, cwd, &mut log, echo).await?;
        }
    }
    log.flush()
        .await
        .map_err(|e| Error::staging("flush build log", e))?;
    Ok(())
}

async fn run_command(
    unit: &BuildUnit,
    phase: Phase,
    command: &str,
    env: &BTreeMap<String, String>,
    cwd: &Path,
    log: &mut tokio::fs::File,
    echo: bool,
) -> Result<()> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::staging(format!("spawn '{command}'"), e))?;

    // Merge the two streams through one channel so neither pipe can fill
    // up and deadlock the child.
    let (tx, mut rx) = mpsc::channel::<String>(256);
    if let Some(stdout) = child.stdout.take() {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
    } else {
        drop(tx);
    }

    while let Some(line) = rx.recv().await {
        log.write_all(line.as_bytes())
            .await
            .and(log.write_all(b"\n").await)
            .map_err(|e| Error::staging("write build log", e))?;
        if echo {
            println!("{line}");
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| Error::staging("wait for build command", e))?;
    if !status.success() {
        let exit_code = exit_code_of(status);
        warn!(unit = %unit.artifact_name, %phase, exit_code, "Build command failed");
        return Err(Error::BuildCommandFailed {
            unit: unit.artifact_name.clone(),
            phase,
            exit_code,
        });
    }
    Ok(())
}

/// Exit code, with signal deaths reported as negative signal numbers.
#[must_use]
pub fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    status.code().unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use morph_graph::{CacheKey, UnitKind, UnitSource};
    use morph_morphology::BuildMode;

    fn unit_with_commands(commands: &[(&str, &[&str])]) -> BuildUnit {
        let mut phase_commands = BTreeMap::new();
        for (phase_name, cmds) in commands {
            let phase = Phase::ALL
                .into_iter()
                .find(|p| p.as_str() == *phase_name)
                .unwrap();
            phase_commands.insert(phase, cmds.iter().map(ToString::to_string).collect());
        }
        BuildUnit {
            kind: UnitKind::Chunk,
            artifact_name: "hello".into(),
            morph_name: "hello".into(),
            stratum_name: None,
            source: UnitSource {
                repo: String::new(),
                ref_name: String::new(),
                sha: "a".repeat(40),
                submodules: vec![],
            },
            canonical_morph: String::new(),
            build_mode: BuildMode::Normal,
            prefix: "/usr".into(),
            max_jobs: None,
            phase_commands,
            split_rules: vec![],
            chunk_artifacts: vec![],
            cache_key: CacheKey::from_hex("b".repeat(64)).unwrap(),
        }
    }

    fn scrubbed_env() -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("PATH".into(), "/usr/bin:/bin".into());
        env
    }

    #[tokio::test]
    async fn phases_run_in_order_and_log_is_captured() {
        let tmp = tempfile::TempDir::new().unwrap();
        let log_path = tmp.path().join("build.log");
        let unit = unit_with_commands(&[
            ("configure", &["echo configuring"]),
            ("build", &["echo building"]),
            ("install", &["echo installing"]),
        ]);
        run_phases(&unit, &scrubbed_env(), tmp.path(), &log_path, false)
            .await
            .unwrap();
        let log = std::fs::read_to_string(&log_path).unwrap();
        let configure = log.find("configuring").unwrap();
        let build = log.find("building").unwrap();
        let install = log.find("installing").unwrap();
        assert!(configure < build && build < install, "{log}");
    }

    #[tokio::test]
    async fn failure_aborts_and_preserves_log() {
        let tmp = tempfile::TempDir::new().unwrap();
        let log_path = tmp.path().join("build.log");
        let unit = unit_with_commands(&[
            ("build", &["echo X", "false", "echo never-reached"]),
        ]);
        let err = run_phases(&unit, &scrubbed_env(), tmp.path(), &log_path, false)
            .await
            .unwrap_err();
        let Error::BuildCommandFailed { phase, exit_code, .. } = err else {
            panic!("expected BuildCommandFailed, got {err}")
        };
        assert_eq!(phase, Phase::Build);
        assert_eq!(exit_code, 1);
        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.contains('X'));
        assert!(!log.contains("never-reached"));
    }

    #[tokio::test]
    async fn stderr_is_merged_into_log() {
        let tmp = tempfile::TempDir::new().unwrap();
        let log_path = tmp.path().join("build.log");
        let unit = unit_with_commands(&[("build", &["echo to-stderr >&2"])]);
        run_phases(&unit, &scrubbed_env(), tmp.path(), &log_path, false)
            .await
            .unwrap();
        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.contains("to-stderr"));
    }

    #[tokio::test]
    async fn environment_is_exactly_what_was_given() {
        let tmp = tempfile::TempDir::new().unwrap();
        let log_path = tmp.path().join("build.log");
        let mut env = scrubbed_env();
        env.insert("PREFIX".into(), "/plover".into());
        let unit = unit_with_commands(&[("build", &["echo prefix $PREFIX home ${HOME:-unset}"])]);
        run_phases(&unit, &env, tmp.path(), &log_path, false)
            .await
            .unwrap();
        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.contains("prefix /plover"));
        assert!(log.contains("home unset"));
    }
}

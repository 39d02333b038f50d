//! Artifact deployment.
//!
//! Each deploy writes the artifact to a fresh executable temp file, stops
//! whatever was running before, and starts the new executable with stdio
//! inherited from the agent. At most one deployed process runs at a time;
//! the previous executable file is removed once its replacement is in.

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;

use tempfile::TempPath;
use tokio::process::{Child, Command};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("artifact is empty")]
    EmptyArtifact,

    #[error("could not write artifact: {0}")]
    Write(std::io::Error),

    #[error("could not start {path}: {source}")]
    Spawn {
        path: String,
        source: std::io::Error,
    },

    #[error("could not wait for {path}: {source}")]
    Wait {
        path: String,
        source: std::io::Error,
    },

    #[error("{path} exited with {status}")]
    Exited {
        path: String,
        status: std::process::ExitStatus,
    },
}

/// How a deployed process is supervised
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SupervisionMode {
    /// Start the process and track it until the next deploy replaces it
    #[default]
    FireAndForget,

    /// Block until the process exits, surfacing a failed exit as an error
    RunToCompletion,
}

impl FromStr for SupervisionMode {
    type Err = anyhow::Error;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text {
            "fire-and-forget" => Ok(Self::FireAndForget),
            "run-to-completion" => Ok(Self::RunToCompletion),
            other => Err(anyhow::anyhow!("unknown supervision mode '{other}'")),
        }
    }
}

/// The outcome of a successful deploy
pub struct Deployed {
    pub pid: Option<u32>,
    pub path: String,
}

struct RunningProcess {
    child: Child,
    // Dropping the path deletes the executable file
    path: TempPath,
    cid: String,
}

pub struct Deployer {
    artifact_dir: PathBuf,
    mode: SupervisionMode,
    current: Option<RunningProcess>,
}

impl Deployer {
    pub fn new(artifact_dir: PathBuf, mode: SupervisionMode) -> Self {
        Self {
            artifact_dir,
            mode,
            current: None,
        }
    }

    pub fn current_pid(&self) -> Option<u32> {
        self.current.as_ref().and_then(|process| process.child.id())
    }

    /// Replace the running process with the given artifact
    pub async fn deploy(&mut self, cid: &str, bytes: &[u8]) -> Result<Deployed, DeployError> {
        if bytes.is_empty() {
            return Err(DeployError::EmptyArtifact);
        }

        let path = self.write_executable(bytes).map_err(DeployError::Write)?;
        self.stop_current().await;

        let path_text = path.display().to_string();
        let mut child = Command::new(path.as_os_str())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| DeployError::Spawn {
                path: path_text.clone(),
                source,
            })?;
        let pid = child.id();
        info!("deployed {cid} as {path_text}, pid {pid:?}");

        match self.mode {
            SupervisionMode::FireAndForget => {
                self.current = Some(RunningProcess {
                    child,
                    path,
                    cid: cid.to_string(),
                });
            }
            SupervisionMode::RunToCompletion => {
                let status = child.wait().await.map_err(|source| DeployError::Wait {
                    path: path_text.clone(),
                    source,
                })?;
                if !status.success() {
                    return Err(DeployError::Exited {
                        path: path_text,
                        status,
                    });
                }
                info!("{cid} ran to completion");
            }
        }
        Ok(Deployed {
            pid,
            path: path_text,
        })
    }

    /// Kill and reap the running process, if any
    pub async fn stop_current(&mut self) {
        if let Some(mut previous) = self.current.take() {
            info!("stopping previous deployment {}", previous.cid);
            if let Err(err) = previous.child.start_kill() {
                warn!("previous process could not be killed: {err}");
            }
            let _ = previous.child.wait().await;
        }
    }

    fn write_executable(&self, bytes: &[u8]) -> Result<TempPath, std::io::Error> {
        let mut file = tempfile::Builder::new()
            .prefix("exe-")
            .suffix(".bin")
            .tempfile_in(&self.artifact_dir)?;
        file.write_all(bytes)?;
        file.flush()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.as_file().set_permissions(std::fs::Permissions::from_mode(0o755))?;
        }

        Ok(file.into_temp_path())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::Path;

    const SLEEPER: &[u8] = b"#!/bin/sh\nsleep 30\n";

    #[tokio::test]
    async fn deploys_an_executable() {
        let dir = tempfile::tempdir().unwrap();
        let mut deployer = Deployer::new(dir.path().to_path_buf(), SupervisionMode::FireAndForget);

        let deployed = deployer.deploy("bafytest", SLEEPER).await.unwrap();
        assert!(deployed.pid.is_some());
        assert!(Path::new(&deployed.path).exists());
        assert_eq!(deployer.current_pid(), deployed.pid);

        deployer.stop_current().await;
        assert!(deployer.current_pid().is_none());
    }

    #[tokio::test]
    async fn redeploy_replaces_the_previous_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut deployer = Deployer::new(dir.path().to_path_buf(), SupervisionMode::FireAndForget);

        let first = deployer.deploy("bafyfirst", SLEEPER).await.unwrap();
        let second = deployer.deploy("bafysecond", SLEEPER).await.unwrap();

        assert_ne!(first.pid, second.pid);
        assert_eq!(deployer.current_pid(), second.pid);
        // the first executable is gone once its replacement is running
        assert!(!Path::new(&first.path).exists());
        assert!(Path::new(&second.path).exists());

        deployer.stop_current().await;
    }

    #[tokio::test]
    async fn rejects_an_empty_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let mut deployer = Deployer::new(dir.path().to_path_buf(), SupervisionMode::FireAndForget);
        assert!(matches!(
            deployer.deploy("bafyempty", b"").await,
            Err(DeployError::EmptyArtifact)
        ));
    }

    #[tokio::test]
    async fn reports_unspawnable_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let mut deployer = Deployer::new(dir.path().to_path_buf(), SupervisionMode::FireAndForget);
        // not a valid executable or script
        let result = deployer.deploy("bafybad", &[0u8; 16]).await;
        assert!(matches!(result, Err(DeployError::Spawn { .. })));
    }

    #[tokio::test]
    async fn run_to_completion_waits_for_exit() {
        let dir = tempfile::tempdir().unwrap();
        let mut deployer =
            Deployer::new(dir.path().to_path_buf(), SupervisionMode::RunToCompletion);

        let deployed = deployer.deploy("bafyok", b"#!/bin/sh\nexit 0\n").await.unwrap();
        assert!(deployed.pid.is_some());
        // nothing is left tracked once the process has completed
        assert!(deployer.current_pid().is_none());
    }

    #[tokio::test]
    async fn run_to_completion_surfaces_a_failed_exit() {
        let dir = tempfile::tempdir().unwrap();
        let mut deployer =
            Deployer::new(dir.path().to_path_buf(), SupervisionMode::RunToCompletion);
        assert!(matches!(
            deployer.deploy("bafyfail", b"#!/bin/sh\nexit 3\n").await,
            Err(DeployError::Exited { .. })
        ));
    }

    #[test]
    fn supervision_modes_parse_from_config_text() {
        assert_eq!(
            "fire-and-forget".parse::<SupervisionMode>().unwrap(),
            SupervisionMode::FireAndForget
        );
        assert_eq!(
            "run-to-completion".parse::<SupervisionMode>().unwrap(),
            SupervisionMode::RunToCompletion
        );
        assert!("daemon".parse::<SupervisionMode>().is_err());
    }
}

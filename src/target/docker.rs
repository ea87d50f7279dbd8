use std::process::{Output, Stdio};

use anyhow::{Context, bail};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::{ContainerRuntime, ContainerSpec};

const STOP_GRACE_SECONDS: &str = "2";

/// Drives the `docker` command line client.
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn output(&self, args: &[&str]) -> anyhow::Result<Output> {
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to execute {} {}", self.binary, args.join(" ")))
    }

    async fn checked(&self, args: &[&str]) -> anyhow::Result<Output> {
        let output = self.output(args).await?;
        if !output.status.success() {
            bail!(
                "{} {} exited with {}: {}",
                self.binary,
                args.first().copied().unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output)
    }

    fn run_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--network".to_string(),
            spec.network.clone(),
            "--network-alias".to_string(),
            spec.alias.clone(),
            "--volume".to_string(),
            format!(
                "{}:{}:ro",
                spec.mount_source.display(),
                spec.mount_target
            ),
            "--workdir".to_string(),
            spec.mount_target.clone(),
            "--memory".to_string(),
            spec.memory.clone(),
            "--cpus".to_string(),
            spec.cpus.clone(),
            "--pids-limit".to_string(),
            spec.pids_limit.to_string(),
            "--cap-drop".to_string(),
            "ALL".to_string(),
            "--security-opt".to_string(),
            "no-new-privileges".to_string(),
            spec.image.clone(),
        ];
        args.extend(spec.command.iter().cloned());
        args
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn network_exists(&self, name: &str) -> anyhow::Result<bool> {
        let output = self.output(&["network", "inspect", name]).await?;
        Ok(output.status.success())
    }

    async fn create_network(&self, name: &str) -> anyhow::Result<()> {
        self.checked(&["network", "create", "--internal", name])
            .await?;
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> anyhow::Result<()> {
        self.checked(&["network", "rm", name]).await?;
        Ok(())
    }

    async fn start(&self, spec: &ContainerSpec) -> anyhow::Result<mpsc::Receiver<String>> {
        let mut child = Command::new(&self.binary)
            .args(Self::run_args(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to start container {}", spec.name))?;

        let stdout = child
            .stdout
            .take()
            .context("container stdout is not captured")?;
        let (tx, rx) = mpsc::channel(256);
        let name = spec.name.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            // Keep draining after the receiver is gone so the container never blocks on stdout
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let _ = tx.send(line).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::debug!("Stopped reading output of {name}: {e}");
                        break;
                    }
                }
            }
            drop(tx);
            match child.wait().await {
                Ok(status) => log::debug!("Container {name} exited with {status}"),
                Err(e) => log::warn!("Failed to wait for container {name}: {e}"),
            }
        });

        Ok(rx)
    }

    async fn stop(&self, name: &str) -> anyhow::Result<()> {
        let output = self
            .output(&["stop", "--time", STOP_GRACE_SECONDS, name])
            .await?;
        tolerate_missing("stop", name, &output)
    }

    async fn remove(&self, name: &str) -> anyhow::Result<()> {
        let output = self.output(&["rm", "--force", name]).await?;
        tolerate_missing("rm", name, &output)
    }
}

fn tolerate_missing(command: &str, name: &str, output: &Output) -> anyhow::Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("No such container") {
        return Ok(());
    }
    bail!("docker {command} {name} exited with {}: {}", output.status, stderr.trim())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn test_run_args_apply_isolation_flags() {
        let spec = ContainerSpec {
            name: "target-7-abc".into(),
            image: "webjudge-target:latest".into(),
            command: vec!["serve".into(), "--port".into(), "8080".into()],
            network: "webjudge-internal".into(),
            alias: "target-7-abc".into(),
            mount_source: PathBuf::from("/tmp/webjudge-x"),
            mount_target: "/srv/app".into(),
            memory: "256m".into(),
            cpus: "0.5".into(),
            pids_limit: 128,
        };
        let args = DockerCli::run_args(&spec);
        let joined = args.join(" ");

        assert!(joined.starts_with("run --rm --name target-7-abc"));
        assert!(joined.contains("--network webjudge-internal"));
        assert!(joined.contains("--volume /tmp/webjudge-x:/srv/app:ro"));
        assert!(joined.contains("--cap-drop ALL"));
        assert!(joined.contains("--security-opt no-new-privileges"));
        assert!(joined.contains("--pids-limit 128"));
        assert!(joined.ends_with("webjudge-target:latest serve --port 8080"));
    }
}

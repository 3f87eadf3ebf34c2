//! Docker backend — drives worker environments through the `docker` CLI.
//!
//! Commands run in a subprocess with captured output and a timeout. Listing
//! uses `docker ps --format '{{json .}}'` and parses one JSON object per
//! line.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::RuntimeError;

use super::{ObservedWorker, PortBinding, WorkerRuntime, WorkerSpec};

/// Budget for any single docker invocation. Creation can pull layers, so
/// this is generous.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// `0.0.0.0:10100->3000/tcp` style entries in `docker ps` output.
static PORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:[\d.]+|\[[^\]]*\]):(\d+)->(\d+)/tcp").expect("port regex"));

/// Docker CLI runtime.
pub struct DockerRuntime {
    binary: String,
}

impl DockerRuntime {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, RuntimeError> {
        debug!(args = ?args, "docker invocation");

        let child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RuntimeError::CommandFailed(format!("spawn docker: {e}")))?;

        let output = tokio::time::timeout(COMMAND_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| RuntimeError::Timeout {
                timeout: COMMAND_TIMEOUT,
            })?
            .map_err(|e| RuntimeError::CommandFailed(format!("wait for docker: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() {
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(RuntimeError::CommandFailed(format!(
                "docker {} exited with {}: {}",
                args.first().unwrap_or(&""),
                output.status,
                stderr
            )))
        }
    }
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerRuntime for DockerRuntime {
    async fn create(&self, spec: &WorkerSpec) -> Result<String, RuntimeError> {
        // Normalized to bytes so a malformed limit degrades to the default
        // instead of failing the create.
        let memory = format!("--memory={}", parse_memory_limit(&spec.memory));
        let shm = format!("--shm-size={}", spec.shm_size);
        let cpus = format!("--cpus={}", spec.cpus);
        let network = format!("--network={}", spec.network);

        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            spec.name.clone(),
            memory,
            shm,
            cpus,
            network,
            "--restart=unless-stopped".into(),
        ];
        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        for binding in &spec.ports {
            args.push("-p".into());
            args.push(format!("{}:{}", binding.host, binding.container));
        }
        for volume in &spec.volumes {
            args.push("-v".into());
            args.push(volume.clone());
        }
        for (key, value) in &spec.labels {
            args.push("--label".into());
            args.push(format!("{key}={value}"));
        }
        args.push(spec.image.clone());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = self.run(&arg_refs).await?;
        if id.is_empty() {
            return Err(RuntimeError::InvalidResponse(
                "docker create returned no id".to_string(),
            ));
        }
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.run(&["start", id]).await.map(|_| ())
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let grace_secs = grace.as_secs().to_string();
        self.run(&["stop", "-t", &grace_secs, id]).await.map(|_| ())
    }

    async fn remove(&self, id_or_name: &str, force: bool) -> Result<(), RuntimeError> {
        let result = if force {
            self.run(&["rm", "-f", id_or_name]).await
        } else {
            self.run(&["rm", id_or_name]).await
        };
        match result {
            Ok(_) => Ok(()),
            // Removing something that is already gone is a no-op.
            Err(RuntimeError::CommandFailed(msg)) if msg.contains("No such container") => {
                debug!(id = %id_or_name, "remove: container already absent");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn list_labeled(
        &self,
        label_key: &str,
        label_value: &str,
    ) -> Result<Vec<ObservedWorker>, RuntimeError> {
        let filter = format!("label={label_key}={label_value}");
        let output = self
            .run(&["ps", "-a", "--filter", &filter, "--format", "{{json .}}"])
            .await?;

        let mut workers = Vec::new();
        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<PsLine>(line) {
                Ok(ps) => workers.push(ps.into_observed()),
                Err(e) => {
                    warn!(error = %e, "skipping unparseable docker ps line");
                }
            }
        }
        Ok(workers)
    }
}

/// One line of `docker ps --format '{{json .}}'`.
#[derive(Debug, serde::Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Labels", default)]
    labels: String,
    #[serde(rename = "Ports", default)]
    ports: String,
}

impl PsLine {
    fn into_observed(self) -> ObservedWorker {
        let labels: HashMap<String, String> = self
            .labels
            .split(',')
            .filter_map(|pair| {
                let (key, value) = pair.split_once('=')?;
                Some((key.trim().to_string(), value.trim().to_string()))
            })
            .collect();

        let ports = parse_port_bindings(&self.ports);

        ObservedWorker {
            id: self.id,
            name: self.names,
            running: self.state == "running",
            labels,
            ports,
        }
    }
}

/// Parse the `Ports` column into container → host bindings.
fn parse_port_bindings(ports: &str) -> Vec<PortBinding> {
    let mut bindings: Vec<PortBinding> = Vec::new();
    for caps in PORT_RE.captures_iter(ports) {
        let host: u16 = match caps[1].parse() {
            Ok(p) => p,
            Err(_) => continue,
        };
        let container: u16 = match caps[2].parse() {
            Ok(p) => p,
            Err(_) => continue,
        };
        let binding = PortBinding { container, host };
        // IPv4 and IPv6 binds show up as separate entries for the same pair.
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
    }
    bindings
}

/// Parse a memory limit string ("2g", "512m", "1024k") to bytes.
pub fn parse_memory_limit(limit: &str) -> u64 {
    static MEM_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^(\d+)([gmk]?)$").expect("memory regex"));

    let lowered = limit.to_lowercase();
    let Some(caps) = MEM_RE.captures(&lowered) else {
        return 2 * 1024 * 1024 * 1024;
    };
    let value: u64 = caps[1].parse().unwrap_or(2);
    match &caps[2] {
        "g" => value * 1024 * 1024 * 1024,
        "m" => value * 1024 * 1024,
        "k" => value * 1024,
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_port_bindings() {
        let bindings =
            parse_port_bindings("0.0.0.0:10100->3000/tcp, [::]:10100->3000/tcp, 0.0.0.0:16000->6080/tcp");
        assert_eq!(
            bindings,
            vec![
                PortBinding {
                    container: 3000,
                    host: 10100
                },
                PortBinding {
                    container: 6080,
                    host: 16000
                },
            ]
        );
    }

    #[test]
    fn empty_ports_column() {
        assert!(parse_port_bindings("").is_empty());
    }

    #[test]
    fn memory_limit_units() {
        assert_eq!(parse_memory_limit("2g"), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("512m"), 512 * 1024 * 1024);
        assert_eq!(parse_memory_limit("64k"), 64 * 1024);
        assert_eq!(parse_memory_limit("1048576"), 1_048_576);
    }

    #[test]
    fn bad_memory_limit_falls_back_to_2g() {
        assert_eq!(parse_memory_limit("lots"), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn ps_line_labels_and_state() {
        let line = r#"{"ID":"abc123","Names":"browser-agent-58","State":"running","Labels":"orchestrator.kind=browser-agent,orchestrator.tenant=58","Ports":"0.0.0.0:10100->3000/tcp"}"#;
        let ps: PsLine = serde_json::from_str(line).unwrap();
        let observed = ps.into_observed();
        assert!(observed.running);
        assert_eq!(
            observed.labels.get("orchestrator.tenant").map(String::as_str),
            Some("58")
        );
        assert_eq!(observed.ports[0].host, 10100);
    }
}

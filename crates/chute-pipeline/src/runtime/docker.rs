//! Container runtime backed by the engine's CLI.
//!
//! Every call spawns one CLI process. Network attachments are applied after
//! start by creating a veth pair and moving the container end into the
//! container's namespace.

use std::path::PathBuf;

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use super::*;

#[derive(Clone)]
pub struct DockerCli {
    binary: PathBuf,
    /// Scratch space for generated Dockerfiles.
    build_dir: PathBuf,
    /// Attachments recorded at create, applied on every start.
    attachments: Arc<DashMap<String, Vec<NetAttachment>>>,
}

impl DockerCli {
    pub fn new(binary: impl Into<PathBuf>, build_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            build_dir: build_dir.into(),
            attachments: Arc::new(DashMap::new()),
        }
    }

    async fn run(&self, args: &[String]) -> Result<String> {
        run_command(&self.binary.to_string_lossy(), args).await
    }

    async fn attach_interfaces(&self, name: &str) -> Result<()> {
        let attachments = match self.attachments.get(name) {
            Some(a) if !a.is_empty() => a.clone(),
            _ => return Ok(()),
        };
        let pid = match self.inspect(name).await? {
            Some(info) if info.state.pid > 0 => info.state.pid.to_string(),
            _ => return Err(RuntimeError::NotFound(name.to_string())),
        };

        for a in attachments {
            let peer = format!("{}c", truncate(&a.host_intf, 14));
            let ns = |args: &[&str]| {
                let mut v: Vec<String> = ["-t", pid.as_str(), "-n", "ip"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect();
                v.extend(args.iter().map(|s| s.to_string()));
                v
            };
            // A leftover pair from a previous start is fine to lose.
            let _ = run_command("ip", &strings(&["link", "del", a.host_intf.as_str()])).await;
            run_command(
                "ip",
                &strings(&[
                    "link",
                    "add",
                    a.host_intf.as_str(),
                    "type",
                    "veth",
                    "peer",
                    "name",
                    peer.as_str(),
                ]),
            )
            .await?;
            run_command("ip", &strings(&["link", "set", peer.as_str(), "netns", pid.as_str()])).await?;
            run_command("nsenter", &ns(&["link", "set", peer.as_str(), "name", a.container_intf.as_str()]))
                .await?;
            run_command("nsenter", &ns(&["addr", "add", a.address.as_str(), "dev", a.container_intf.as_str()]))
                .await?;
            run_command("nsenter", &ns(&["link", "set", a.container_intf.as_str(), "up"])).await?;
            run_command("ip", &strings(&["link", "set", a.host_intf.as_str(), "up"])).await?;
            tracing::debug!(container = %name, host = %a.host_intf, inner = %a.container_intf, "interface attached");
        }
        Ok(())
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

async fn run_command(program: &str, args: &[String]) -> Result<String> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        Err(RuntimeError::Command {
            command: format!("{program} {}", args.first().map(String::as_str).unwrap_or("")),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

fn is_missing(err: &RuntimeError) -> bool {
    matches!(err, RuntimeError::Command { stderr, .. }
        if stderr.contains("No such") || stderr.contains("not found"))
}

fn dockerfile(base: &str, command: &[String]) -> Result<String> {
    let mut text = format!("FROM {base}\nWORKDIR /opt/chute\nCOPY . /opt/chute\n");
    if !command.is_empty() {
        text.push_str(&format!("CMD {}\n", serde_json::to_string(command)?));
    }
    Ok(text)
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    fn runtime_type(&self) -> &'static str {
        "docker"
    }

    async fn prepare_image(&self, spec: &ImageSpec) -> Result<()> {
        match &spec.source {
            ImageSource::External { reference } => {
                self.run(&strings(&["pull", reference.as_str()])).await?;
            }
            ImageSource::Light { base, command } => {
                let dir = self.build_dir.join(spec.tag.replace([':', '/'], "_"));
                tokio::fs::create_dir_all(&dir).await?;
                tokio::fs::write(dir.join("Dockerfile"), dockerfile(base, command)?).await?;
                self.run(&strings(&["build", "-t", spec.tag.as_str(), &*dir.to_string_lossy()]))
                    .await?;
            }
            ImageSource::Context { dir } => {
                self.run(&strings(&["build", "-t", spec.tag.as_str(), &*dir.to_string_lossy()]))
                    .await?;
            }
        }
        tracing::info!(tag = %spec.tag, "image ready");
        Ok(())
    }

    async fn remove_image(&self, tag: &str) -> Result<()> {
        match self.run(&strings(&["rmi", "-f", tag])).await {
            Err(e) if is_missing(&e) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<()> {
        let mut args = strings(&["create", "--name", spec.name.as_str()]);
        if spec.cpu_shares > 0 {
            args.push(format!("--cpu-shares={}", spec.cpu_shares));
        }
        if let Some(memory) = spec.memory {
            args.push(format!("--memory={memory}"));
        }
        for (k, v) in &spec.labels {
            args.push(format!("--label={k}={v}"));
        }
        for (k, v) in &spec.env {
            args.push(format!("--env={k}={v}"));
        }
        for v in &spec.volumes {
            args.push(format!("--volume={}:{}", v.host.display(), v.container));
        }
        for p in &spec.ports {
            args.push(format!("--publish={}:{}/{}", p.host, p.container, p.protocol));
        }
        for cap in &spec.capabilities {
            args.push(format!("--cap-add={cap}"));
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());

        self.run(&args).await?;
        self.attachments
            .insert(spec.name.clone(), spec.attachments.clone());
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.run(&strings(&["start", name])).await?;
        self.attach_interfaces(name).await
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.run(&strings(&["stop", name])).await.map(|_| ())
    }

    async fn restart(&self, name: &str) -> Result<()> {
        self.run(&strings(&["restart", name])).await?;
        self.attach_interfaces(name).await
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let result = self.run(&strings(&["rm", "-f", name])).await;
        self.attachments.remove(name);
        match result {
            Err(e) if is_missing(&e) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerInspect>> {
        match self
            .run(&strings(&["inspect", "--type", "container", name]))
            .await
        {
            Ok(out) => {
                let mut docs: Vec<ContainerInspect> = serde_json::from_str(&out)?;
                Ok(docs.pop())
            }
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_chute_containers(&self) -> Result<Vec<String>> {
        let out = self
            .run(&strings(&[
                "ps",
                "-a",
                "--filter",
                format!("label={CHUTE_LABEL}").as_str(),
                "--format",
                "{{.Names}}",
            ]))
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

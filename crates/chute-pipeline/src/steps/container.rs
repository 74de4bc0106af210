//! Container lifecycle steps.
//!
//! Every engine call carries the runtime deadline; image preparation gets
//! ten times that. `start` insists on a stopped container; `stop` and
//! `remove` are no-ops for containers already in the requested state.

use std::collections::BTreeMap;

use chute_core::{Chute, Service, ServiceType};

use super::network::ChuteInterface;
use super::resources::{allocate, Allocation, MIN_SHARES, SHARES_PER_CHUTE};
use super::runtime::{api_token, DATA_MOUNT};
use super::StepEnv;
use crate::error::{with_deadline, PipelineError, Result};
use crate::runtime::{
    ContainerSpec, ImageSource, ImageSpec, NetAttachment, PortPublish, VolumeMount, CHUTE_LABEL,
};
use crate::step::{PreambleSource, StepOutcome};
use crate::update::{keys, CacheValue, Update};

// ── Specs ─────────────────────────────────────────────────────────────────────

/// Per-update inputs a container is created with.
#[derive(Debug, Clone, Default)]
pub struct Preamble {
    pub interfaces: Vec<ChuteInterface>,
    pub allocation: Option<Allocation>,
    pub volumes: Vec<VolumeMount>,
    pub token: String,
}

impl Preamble {
    /// What this update's generators computed for `chute`.
    pub fn planned(update: &Update, chute: &Chute) -> Self {
        Self {
            interfaces: update.cache.interfaces().to_vec(),
            allocation: update
                .cache
                .allocation()
                .and_then(|a| a.get(&chute.name))
                .cloned(),
            volumes: update.cache.volumes().map(<[_]>::to_vec).unwrap_or_default(),
            token: update.cache.token().map(str::to_string).unwrap_or_else(api_token),
        }
    }

    /// What `chute` ran with before this update, for recreating it on rollback.
    ///
    /// Shares come from the store, which holds the pre-update chutes again by
    /// the time container undo steps run.
    pub fn previous(update: &Update, env: &StepEnv, chute: &Chute) -> Self {
        let stored = env.store.list();
        let running: Vec<&Chute> = stored.iter().filter(|c| c.is_running()).collect();
        Self {
            interfaces: update.cache.previous_interfaces().to_vec(),
            allocation: allocate(&running).remove(&chute.name),
            volumes: vec![VolumeMount {
                host: env.settings.chute_data_dir.join(&chute.name),
                container: DATA_MOUNT.to_string(),
            }],
            token: update
                .cache
                .previous_token()
                .map(str::to_string)
                .unwrap_or_else(api_token),
        }
    }
}

pub fn image_spec(chute: &Chute, service: &Service) -> Result<ImageSpec> {
    let tag = chute.image_tag(service);
    let missing = || {
        PipelineError::Validation(format!(
            "service {} of {} has no image source",
            service.name, chute.name
        ))
    };
    let source = match service.kind {
        ServiceType::Image => ImageSource::External {
            reference: tag.clone(),
        },
        ServiceType::Light => ImageSource::Light {
            base: service.image.clone().ok_or_else(missing)?,
            command: service.command.as_ref().map(|c| c.argv()).unwrap_or_default(),
        },
        ServiceType::Normal => ImageSource::Context {
            dir: chute.source_dir().ok_or_else(missing)?,
        },
    };
    Ok(ImageSpec { tag, source })
}

pub fn container_specs(
    chute: &Chute,
    preamble: &Preamble,
    default_memory: Option<u64>,
) -> Vec<ContainerSpec> {
    let count = chute.services.len().max(1) as u64;
    let chute_shares = preamble
        .allocation
        .as_ref()
        .map_or(SHARES_PER_CHUTE, |a| a.cpu_shares);
    let cpu_shares = (chute_shares / count).max(MIN_SHARES);

    chute
        .services
        .values()
        .map(|service| {
            let mut env = BTreeMap::from([
                ("CHUTE_NAME".to_string(), chute.name.clone()),
                ("CHUTE_VERSION".to_string(), chute.version.to_string()),
                ("CHUTE_API_TOKEN".to_string(), preamble.token.clone()),
            ]);
            env.extend(chute.environment.clone());
            env.extend(service.environment.clone());

            let command = match service.kind {
                ServiceType::Light => Vec::new(),
                _ => service.command.as_ref().map(|c| c.argv()).unwrap_or_default(),
            };

            let attachments = preamble
                .interfaces
                .iter()
                .filter(|i| i.service == service.name)
                .map(|i| NetAttachment {
                    host_intf: i.host_intf.clone(),
                    container_intf: i.container_intf.clone(),
                    address: format!("{}/{}", i.container_addr(), i.subnet.prefix()),
                    gateway: i.host_addr().to_string(),
                })
                .collect();

            ContainerSpec {
                name: chute.container_name(&service.name),
                image: chute.image_tag(service),
                command,
                env,
                volumes: preamble.volumes.clone(),
                ports: service
                    .requests
                    .port_bindings
                    .iter()
                    .map(|p| PortPublish {
                        host: p.host,
                        container: p.container,
                        protocol: p.protocol.clone(),
                    })
                    .collect(),
                capabilities: service.requests.capabilities.clone(),
                cpu_shares,
                memory: service.requests.memory.or(default_memory),
                labels: BTreeMap::from([(CHUTE_LABEL.to_string(), chute.name.clone())]),
                attachments,
            }
        })
        .collect()
}

// ── Images ────────────────────────────────────────────────────────────────────

pub async fn prepare_images(
    update: &mut Update,
    env: &StepEnv,
    chute: &Chute,
) -> Result<StepOutcome> {
    for service in chute.services.values() {
        let spec = image_spec(chute, service)?;
        update.progress(format!("Preparing image {}", spec.tag));
        with_deadline("prepare image", env.settings.runtime_timeout * 10, async {
            env.runtime
                .prepare_image(&spec)
                .await
                .map_err(PipelineError::from)
        })
        .await?;
    }
    Ok(StepOutcome::Done)
}

/// Remove images built on the node. External images are left for other users.
pub async fn remove_images(
    update: &mut Update,
    env: &StepEnv,
    chute: &Chute,
) -> Result<StepOutcome> {
    for service in chute.services.values() {
        if service.kind == ServiceType::Image {
            continue;
        }
        let tag = chute.image_tag(service);
        env.runtime_call("remove image", env.runtime.remove_image(&tag))
            .await?;
        tracing::debug!(chute = %chute.name, tag = %tag, "image removed");
    }
    update.progress(format!("Removed images of {}", chute.name));
    Ok(StepOutcome::Done)
}

// ── Containers ────────────────────────────────────────────────────────────────

pub async fn create(
    update: &mut Update,
    env: &StepEnv,
    chute: &Chute,
    start: bool,
    source: PreambleSource,
) -> Result<StepOutcome> {
    let preamble = match source {
        PreambleSource::Planned => Preamble::planned(update, chute),
        PreambleSource::Previous => Preamble::previous(update, env, chute),
    };
    for volume in &preamble.volumes {
        std::fs::create_dir_all(&volume.host)
            .map_err(|e| PipelineError::io(format!("create {}", volume.host.display()), e))?;
    }

    let specs = container_specs(chute, &preamble, env.settings.default_memory);
    let mut created: Vec<String> = Vec::new();
    for spec in &specs {
        let mut result = env
            .runtime_call("create container", env.runtime.create(spec))
            .await;
        if result.is_ok() {
            created.push(spec.name.clone());
            if start {
                result = env
                    .runtime_call("start container", env.runtime.start(&spec.name))
                    .await;
            }
        }
        if let Err(e) = result {
            for name in created.iter().rev() {
                if let Err(cleanup) = env
                    .runtime_call("remove container", env.runtime.remove(name))
                    .await
                {
                    tracing::warn!(container = %name, error = %cleanup, "cleanup after failed create");
                }
            }
            return Err(e);
        }
    }

    update.progress(format!(
        "{} chute {} version {}",
        if start { "Started" } else { "Created" },
        chute.name,
        chute.version
    ));
    Ok(StepOutcome::Done)
}

/// Start every container of `chute`. Containers started before a failure
/// are stopped again.
pub async fn start(update: &mut Update, env: &StepEnv, chute: &Chute) -> Result<StepOutcome> {
    let mut started: Vec<String> = Vec::new();
    for name in chute.container_names() {
        if let Err(e) = start_one(env, &name).await {
            for name in started.iter().rev() {
                if let Err(cleanup) = env
                    .runtime_call("stop container", env.runtime.stop(name))
                    .await
                {
                    tracing::warn!(container = %name, error = %cleanup, "cleanup after failed start");
                }
            }
            return Err(e);
        }
        started.push(name);
    }
    update.progress(format!("Started chute {}", chute.name));
    Ok(StepOutcome::Done)
}

async fn start_one(env: &StepEnv, name: &str) -> Result<()> {
    match env
        .runtime_call("inspect container", env.runtime.inspect(name))
        .await?
    {
        None => Err(PipelineError::StateConflict(format!(
            "container {name} does not exist"
        ))),
        Some(c) if c.is_running() => Err(PipelineError::StateConflict(format!(
            "container {name} is already running"
        ))),
        Some(_) => {
            env.runtime_call("start container", env.runtime.start(name))
                .await
        }
    }
}

/// Stop every running container of `chute`. Containers stopped before a
/// failure are started again.
pub async fn stop(update: &mut Update, env: &StepEnv, chute: &Chute) -> Result<StepOutcome> {
    let mut stopped: Vec<String> = Vec::new();
    for name in chute.container_names() {
        let result = match env
            .runtime_call("inspect container", env.runtime.inspect(&name))
            .await
        {
            Ok(Some(c)) if c.is_running() => env
                .runtime_call("stop container", env.runtime.stop(&name))
                .await
                .map(|()| true),
            Ok(_) => Ok(false),
            Err(e) => Err(e),
        };
        match result {
            Ok(true) => stopped.push(name),
            Ok(false) => {}
            Err(e) => {
                for name in stopped.iter().rev() {
                    if let Err(cleanup) = env
                        .runtime_call("start container", env.runtime.start(name))
                        .await
                    {
                        tracing::warn!(container = %name, error = %cleanup, "cleanup after failed stop");
                    }
                }
                return Err(e);
            }
        }
    }
    update.progress(format!("Stopped chute {}", chute.name));
    Ok(StepOutcome::Done)
}

pub async fn restart(update: &mut Update, env: &StepEnv, chute: &Chute) -> Result<StepOutcome> {
    for name in chute.container_names() {
        env.runtime_call("restart container", env.runtime.restart(&name))
            .await?;
    }
    update.progress(format!("Restarted chute {}", chute.name));
    Ok(StepOutcome::Done)
}

/// Remove every container of `chute`. The API token the containers ran
/// with is kept in the cache so a rollback can hand it back.
pub async fn remove(update: &mut Update, env: &StepEnv, chute: &Chute) -> Result<StepOutcome> {
    for name in chute.container_names() {
        let Some(found) = env
            .runtime_call("inspect container", env.runtime.inspect(&name))
            .await?
        else {
            continue;
        };
        if let Some(token) = found.env_var("CHUTE_API_TOKEN") {
            if !update.cache.contains(keys::PREVIOUS_TOKEN) {
                update
                    .cache
                    .set(keys::PREVIOUS_TOKEN, CacheValue::Token(token.to_string()));
            }
        }
        env.runtime_call("remove container", env.runtime.remove(&name))
            .await?;
    }
    update.progress(format!("Removed containers of {}", chute.name));
    Ok(StepOutcome::Done)
}

pub async fn remove_all(update: &mut Update, env: &StepEnv) -> Result<StepOutcome> {
    let names = env
        .runtime_call("list containers", env.runtime.list_chute_containers())
        .await?;
    for name in &names {
        env.runtime_call("remove container", env.runtime.remove(name))
            .await?;
    }
    update.progress(format!("Removed {} chute container(s)", names.len()));
    Ok(StepOutcome::Done)
}

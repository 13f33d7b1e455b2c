//! Mount materialization.
//!
//! Docker promises bind-mount content is visible the moment the container
//! starts; a pod spec is immutable once created. The planner resolves the
//! tension per mount, once, into a tagged decision:
//!
//! - `Inject`: single files at or under the config-object ceiling become a
//!   config map entry mounted at the target path, present at the first
//!   instant of start.
//! - `Copy`: directories and oversized files are delivered right after the
//!   workload reports running, as a tar stream over the exec channel. A
//!   documented deviation: content lands within a bounded delay after
//!   start, not at the exact transition instant.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::kube::{copy::copy_archive_to, Orchestrator};
use crate::model::{Mount, MountKind, MountMode, PreArchive};

/// Size ceiling of the config-object injection mechanism (1 MiB).
pub const CONFIG_MAP_CEILING: u64 = 1 << 20;

/// Content source of a post-start copy.
#[derive(Debug, Clone)]
pub enum CopySource {
    /// A host directory, packed into a tar stream at copy time.
    Folder(PathBuf),
    /// A raw tar archive received over the copy endpoint.
    Archive(Vec<u8>),
}

/// The per-mount decision.
#[derive(Debug, Clone)]
pub enum MountAction {
    /// Injected before start through a config object entry.
    Inject {
        /// Config map key backing the file.
        key: String,
        /// File content.
        data: Vec<u8>,
        /// Mount the file read-only.
        read_only: bool,
    },
    /// Copied into the workload after it reports running.
    Copy {
        /// Where the content comes from.
        source: CopySource,
    },
}

/// One planned mount.
#[derive(Debug, Clone)]
pub struct PlanEntry {
    /// Absolute target path inside the container.
    pub target: String,
    /// The decision for this mount.
    pub action: MountAction,
}

/// The full plan for a container. An `Inject` entry may be referenced by
/// pre-start resources; a `Copy` entry never is.
#[derive(Debug, Clone, Default)]
pub struct MountPlan {
    /// Planned mounts, in declaration order.
    pub entries: Vec<PlanEntry>,
}

impl MountPlan {
    /// Entries injected before start.
    pub fn injected(&self) -> impl Iterator<Item = &PlanEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.action, MountAction::Inject { .. }))
    }

    /// Entries copied after start.
    pub fn copied(&self) -> impl Iterator<Item = &PlanEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.action, MountAction::Copy { .. }))
    }

    /// True when at least one entry needs a post-start copy.
    #[must_use]
    pub fn has_post_start(&self) -> bool {
        self.copied().next().is_some()
    }
}

/// Derives a config-map key from a target path: readable where possible,
/// suffixed with a path hash so distinct targets never collide.
#[must_use]
pub fn volume_key(target: &str) -> String {
    let mut sanitized: String = target
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    sanitized = sanitized.trim_matches('-').to_string();
    if sanitized.is_empty() {
        sanitized = "root".to_string();
    }
    let mut hasher = DefaultHasher::new();
    target.hash(&mut hasher);
    format!("{sanitized}-{:08x}", hasher.finish() as u32)
}

/// Plans and performs mount delivery.
#[derive(Debug, Clone)]
pub struct MountMaterializer {
    disable_exec_copy: bool,
}

impl MountMaterializer {
    /// Creates a materializer. With `disable_exec_copy`, mounts that would
    /// need the post-start path fail at planning time.
    #[must_use]
    pub fn new(disable_exec_copy: bool) -> Self {
        Self { disable_exec_copy }
    }

    /// Decides, per mount and pre-start archive, injection versus copy.
    pub fn plan(&self, mounts: &[Mount], pre_archives: &[PreArchive]) -> Result<MountPlan> {
        let mut entries = Vec::new();

        for mount in mounts {
            entries.push(self.plan_mount(mount)?);
        }
        for pa in pre_archives {
            entries.push(self.plan_pre_archive(pa)?);
        }

        Ok(MountPlan { entries })
    }

    fn plan_mount(&self, mount: &Mount) -> Result<PlanEntry> {
        let size = std::fs::metadata(&mount.source).map(|m| m.len()).ok();

        if mount.kind == MountKind::File && size.map(|s| s <= CONFIG_MAP_CEILING).unwrap_or(false) {
            let data = std::fs::read(&mount.source).map_err(|err| Error::InvalidSpec {
                reason: format!("could not read mount source {}: {err}", mount.source.display()),
            })?;
            return Ok(PlanEntry {
                target: mount.target.clone(),
                action: MountAction::Inject {
                    key: volume_key(&mount.target),
                    data,
                    read_only: mount.mode == MountMode::ReadOnly,
                },
            });
        }

        if mount.kind == MountKind::File && size.is_none() {
            return Err(Error::InvalidSpec {
                reason: format!("mount source {} does not exist", mount.source.display()),
            });
        }

        if self.disable_exec_copy {
            return Err(Error::MountTooLarge {
                target: mount.target.clone(),
            });
        }

        debug!(target = %mount.target, "mount deferred to post-start copy");
        let source = match mount.kind {
            MountKind::Directory => CopySource::Folder(mount.source.clone()),
            MountKind::File => CopySource::Archive(pack_single_file(&mount.source)?),
        };
        Ok(PlanEntry {
            target: mount.target.clone(),
            action: MountAction::Copy { source },
        })
    }

    fn plan_pre_archive(&self, pa: &PreArchive) -> Result<PlanEntry> {
        if (pa.archive.len() as u64) <= CONFIG_MAP_CEILING {
            if let Some((name, data)) = single_file_in_archive(&pa.archive) {
                let target = join_target(&pa.target, &name);
                return Ok(PlanEntry {
                    action: MountAction::Inject {
                        key: volume_key(&target),
                        data,
                        read_only: false,
                    },
                    target,
                });
            }
        }
        if self.disable_exec_copy {
            return Err(Error::MountTooLarge {
                target: pa.target.clone(),
            });
        }
        Ok(PlanEntry {
            target: pa.target.clone(),
            action: MountAction::Copy {
                source: CopySource::Archive(pa.archive.clone()),
            },
        })
    }

    /// Delivers every `Copy` entry into the running workload.
    pub async fn copy_post_start(
        &self,
        orch: &dyn Orchestrator,
        container_id: &str,
        pod_name: &str,
        plan: &MountPlan,
    ) -> Result<()> {
        for entry in plan.copied() {
            let MountAction::Copy { source } = &entry.action else {
                continue;
            };
            let (archive, target) = match source {
                CopySource::Folder(dir) => (pack_folder(dir)?, entry.target.clone()),
                CopySource::Archive(bytes) => (bytes.clone(), entry.target.clone()),
            };
            copy_archive_to(orch, pod_name, archive, &target)
                .await
                .map_err(|err| Error::orchestrator(container_id, "mount-copy", err))?;
        }
        Ok(())
    }
}

/// Packs a host directory into a tar archive with entries relative to it.
fn pack_folder(dir: &Path) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_dir_all(".", dir)
        .and_then(|()| builder.into_inner())
        .map_err(|err| Error::InvalidSpec {
            reason: format!("could not archive {}: {err}", dir.display()),
        })
}

/// Packs a single host file under its base name.
fn pack_single_file(path: &Path) -> Result<Vec<u8>> {
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_path_with_name(path, base)
        .and_then(|()| builder.into_inner())
        .map_err(|err| Error::InvalidSpec {
            reason: format!("could not archive {}: {err}", path.display()),
        })
}

/// Returns the name and content of the archive's single regular file, or
/// `None` when the archive holds anything else.
fn single_file_in_archive(bytes: &[u8]) -> Option<(String, Vec<u8>)> {
    let mut archive = tar::Archive::new(bytes);
    let mut found: Option<(String, Vec<u8>)> = None;
    let entries = match archive.entries() {
        Ok(entries) => entries,
        Err(err) => {
            warn!(error = %err, "unreadable pre-start archive");
            return None;
        }
    };
    for entry in entries {
        let Ok(mut entry) = entry else { return None };
        if entry.header().entry_type().is_dir() {
            continue;
        }
        if found.is_some() {
            return None;
        }
        let name = entry.path().ok()?.to_string_lossy().into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).ok()?;
        found = Some((name, data));
    }
    found
}

fn join_target(dir: &str, name: &str) -> String {
    let name = name.trim_start_matches("./");
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

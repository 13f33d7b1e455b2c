//! Translation of a container spec into orchestrator resource objects.
//!
//! The mapper is pure construction: it never talks to the cluster. Given
//! an instance and its mount plan it produces the pod and config objects
//! to submit, and on demand a service object per network alias. Submission
//! and retry live in the lifecycle controller.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use regex::Regex;
use tracing::warn;

use crate::error::{Error, Result};
use crate::model::{
    Container, LABEL_PULL_POLICY, LABEL_REQUEST_CPU, LABEL_REQUEST_MEMORY, LABEL_RUNAS_USER,
    LABEL_SERVICE_ACCOUNT,
};

use super::mounts::{MountAction, MountPlan};

/// Label present on every resource this process creates.
pub const LABEL_MANAGED: &str = "podbridge";
/// Label tying a resource to the short id of its container instance.
pub const LABEL_CONTAINER_ID: &str = "podbridge.container-id";

/// Name of the single workload container inside every created pod.
pub const MAIN_CONTAINER: &str = "main";

/// Selector matching every resource this process created.
#[must_use]
pub fn managed_selector() -> String {
    format!("{LABEL_MANAGED}=true")
}

/// Selector matching the resources of one container instance.
#[must_use]
pub fn container_selector(short_id: &str) -> String {
    format!("{LABEL_CONTAINER_ID}={short_id}")
}

fn alias_pattern() -> &'static Regex {
    // RFC 1035 label, the shape a service name must have.
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z]([-a-z0-9]*[a-z0-9])?$").unwrap())
}

/// Pre-start resources for one container instance.
#[derive(Debug, Clone)]
pub struct ResourceBundle {
    /// The pod realizing the container.
    pub pod: corev1::Pod,
    /// Config objects backing injected mounts; created before the pod.
    pub config_maps: Vec<corev1::ConfigMap>,
}

/// Builds resource objects from container specs.
#[derive(Debug, Clone)]
pub struct ResourceMapper {
    namespace: String,
    service_account: Option<String>,
    pull_policy: Option<String>,
}

impl ResourceMapper {
    /// Creates a mapper for the given namespace.
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            service_account: None,
            pull_policy: None,
        }
    }

    /// Default service account for created pods.
    #[must_use]
    pub fn with_service_account(mut self, account: Option<String>) -> Self {
        self.service_account = account;
        self
    }

    /// Default image pull policy, overridable per container by label.
    #[must_use]
    pub fn with_pull_policy(mut self, policy: Option<String>) -> Self {
        self.pull_policy = policy;
        self
    }

    /// Maps an instance and its mount plan to the resources to submit.
    ///
    /// Rejects duplicate exposed ports and duplicate mount targets.
    pub fn map(&self, tainr: &Container, plan: &MountPlan) -> Result<ResourceBundle> {
        validate(tainr, plan)?;

        let labels = self.instance_labels(tainr);
        let config_maps = self.config_maps(tainr, plan, &labels);
        let pod = self.pod(tainr, plan, &labels, !config_maps.is_empty())?;

        Ok(ResourceBundle { pod, config_maps })
    }

    /// Builds the service object publishing a network alias, or `None`
    /// when the alias cannot become a service (invalid name, no ports).
    #[must_use]
    pub fn alias_service(&self, tainr: &Container, alias: &str) -> Option<corev1::Service> {
        let alias = alias.to_lowercase();
        if !alias_pattern().is_match(&alias) {
            warn!(alias = %alias, id = %tainr.short_id, "alias is not a valid service name, skipped");
            return None;
        }
        if tainr.spec.exposed_ports.is_empty() {
            warn!(alias = %alias, id = %tainr.short_id, "alias without exposed ports, skipped");
            return None;
        }

        let ports = tainr
            .spec
            .exposed_ports
            .iter()
            .map(|&p| corev1::ServicePort {
                name: Some(format!("pb-{p}")),
                port: i32::from(p),
                target_port: Some(IntOrString::Int(i32::from(p))),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            })
            .collect();

        let mut selector = BTreeMap::new();
        selector.insert(LABEL_CONTAINER_ID.to_string(), tainr.short_id.clone());

        Some(corev1::Service {
            metadata: ObjectMeta {
                name: Some(alias),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.instance_labels(tainr)),
                ..Default::default()
            },
            spec: Some(corev1::ServiceSpec {
                selector: Some(selector),
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn instance_labels(&self, tainr: &Container) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_CONTAINER_ID.to_string(), tainr.short_id.clone());
        labels
    }

    fn config_maps(
        &self,
        tainr: &Container,
        plan: &MountPlan,
        labels: &BTreeMap<String, String>,
    ) -> Vec<corev1::ConfigMap> {
        let mut binary_data = BTreeMap::new();
        for entry in plan.injected() {
            if let MountAction::Inject { key, data, .. } = &entry.action {
                binary_data.insert(key.clone(), ByteString(data.clone()));
            }
        }
        if binary_data.is_empty() {
            return Vec::new();
        }
        vec![corev1::ConfigMap {
            metadata: ObjectMeta {
                name: Some(volume_files_name(&tainr.short_id)),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            binary_data: Some(binary_data),
            ..Default::default()
        }]
    }

    fn pod(
        &self,
        tainr: &Container,
        plan: &MountPlan,
        labels: &BTreeMap<String, String>,
        has_volume_files: bool,
    ) -> Result<corev1::Pod> {
        let spec = &tainr.spec;

        let env: Vec<corev1::EnvVar> = spec
            .env
            .iter()
            .map(|(name, value)| corev1::EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                ..Default::default()
            })
            .collect();

        let ports: Vec<corev1::ContainerPort> = spec
            .exposed_ports
            .iter()
            .map(|&p| corev1::ContainerPort {
                container_port: i32::from(p),
                name: Some(format!("pb-{p}")),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            })
            .collect();

        let mut volume_mounts = Vec::new();
        if has_volume_files {
            for entry in plan.injected() {
                if let MountAction::Inject { key, read_only, .. } = &entry.action {
                    volume_mounts.push(corev1::VolumeMount {
                        name: "volume-files".to_string(),
                        mount_path: entry.target.clone(),
                        sub_path: Some(key.clone()),
                        read_only: Some(*read_only),
                        ..Default::default()
                    });
                }
            }
        }

        let main = corev1::Container {
            name: MAIN_CONTAINER.to_string(),
            image: Some(spec.image.clone()),
            command: non_empty(&spec.entrypoint),
            args: non_empty(&spec.cmd),
            env: non_empty_vec(env),
            ports: non_empty_vec(ports),
            volume_mounts: non_empty_vec(volume_mounts),
            image_pull_policy: self.pull_policy_for(tainr)?,
            resources: resources_for(tainr)?,
            ..Default::default()
        };

        let volumes = has_volume_files.then(|| {
            vec![corev1::Volume {
                name: "volume-files".to_string(),
                config_map: Some(corev1::ConfigMapVolumeSource {
                    name: Some(volume_files_name(&tainr.short_id)),
                    ..Default::default()
                }),
                ..Default::default()
            }]
        });

        let mut annotations = tainr.spec.labels.clone();
        annotations.insert("podbridge.name".to_string(), tainr.name());

        Ok(corev1::Pod {
            metadata: ObjectMeta {
                name: Some(tainr.pod_name()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(corev1::PodSpec {
                containers: vec![main],
                restart_policy: Some("Never".to_string()),
                service_account_name: self.service_account_for(tainr),
                security_context: security_context_for(tainr)?,
                volumes,
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn pull_policy_for(&self, tainr: &Container) -> Result<Option<String>> {
        let raw = tainr
            .spec
            .labels
            .get(LABEL_PULL_POLICY)
            .cloned()
            .or_else(|| self.pull_policy.clone());
        let Some(raw) = raw else { return Ok(None) };
        match raw.to_lowercase().as_str() {
            "default" => Ok(None),
            "always" => Ok(Some("Always".to_string())),
            "never" => Ok(Some("Never".to_string())),
            "ifnotpresent" => Ok(Some("IfNotPresent".to_string())),
            other => Err(Error::InvalidSpec {
                reason: format!("unknown pull policy `{other}`"),
            }),
        }
    }

    fn service_account_for(&self, tainr: &Container) -> Option<String> {
        tainr
            .spec
            .labels
            .get(LABEL_SERVICE_ACCOUNT)
            .cloned()
            .or_else(|| self.service_account.clone())
    }
}

fn validate(tainr: &Container, plan: &MountPlan) -> Result<()> {
    let mut seen_ports = std::collections::BTreeSet::new();
    for port in &tainr.spec.exposed_ports {
        if !seen_ports.insert(*port) {
            return Err(Error::InvalidSpec {
                reason: format!("exposed port {port} declared twice"),
            });
        }
    }
    let mut seen_targets = std::collections::BTreeSet::new();
    for entry in &plan.entries {
        if !seen_targets.insert(entry.target.as_str()) {
            return Err(Error::InvalidSpec {
                reason: format!("mount target {} declared twice", entry.target),
            });
        }
    }
    Ok(())
}

/// Builds cpu/memory requirements from `io.podbridge.request-*` labels.
/// Label values are `request` or `request,limit`.
fn resources_for(tainr: &Container) -> Result<Option<corev1::ResourceRequirements>> {
    let mut requests = BTreeMap::new();
    let mut limits = BTreeMap::new();

    for (label, resource) in [(LABEL_REQUEST_CPU, "cpu"), (LABEL_REQUEST_MEMORY, "memory")] {
        let Some(raw) = tainr.spec.labels.get(label) else {
            continue;
        };
        let mut parts = raw.splitn(2, ',');
        let request = parts.next().unwrap_or_default().trim();
        if request.is_empty() {
            return Err(Error::InvalidSpec {
                reason: format!("empty value for label {label}"),
            });
        }
        requests.insert(resource.to_string(), Quantity(request.to_string()));
        if let Some(limit) = parts.next() {
            limits.insert(resource.to_string(), Quantity(limit.trim().to_string()));
        }
    }

    if requests.is_empty() {
        return Ok(None);
    }
    Ok(Some(corev1::ResourceRequirements {
        requests: Some(requests),
        limits: (!limits.is_empty()).then_some(limits),
        ..Default::default()
    }))
}

fn security_context_for(tainr: &Container) -> Result<Option<corev1::PodSecurityContext>> {
    let Some(raw) = tainr.spec.labels.get(LABEL_RUNAS_USER) else {
        return Ok(None);
    };
    let uid: i64 = raw.parse().map_err(|_| Error::InvalidSpec {
        reason: format!("could not parse runas-user `{raw}`"),
    })?;
    Ok(Some(corev1::PodSecurityContext {
        run_as_user: Some(uid),
        ..Default::default()
    }))
}

/// Name of the config object backing injected mount files.
#[must_use]
pub fn volume_files_name(short_id: &str) -> String {
    format!("{short_id}-vf")
}

fn non_empty(v: &[String]) -> Option<Vec<String>> {
    (!v.is_empty()).then(|| v.to_vec())
}

fn non_empty_vec<T>(v: Vec<T>) -> Option<Vec<T>> {
    (!v.is_empty()).then_some(v)
}

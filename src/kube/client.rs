//! Kubernetes-backed orchestrator: resource submission, status, deletion.

use std::collections::BTreeSet;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use tokio::net::TcpStream;
use tracing::debug;

use super::{classify, is_not_found, ExecOutput, LogStream, Orchestrator, WorkloadStatus};
use crate::error::OrchestratorError;

/// Orchestrator implementation backed by a Kubernetes cluster.
#[derive(Clone)]
pub struct KubeOrchestrator {
    pods: Api<Pod>,
    services: Api<Service>,
    config_maps: Api<ConfigMap>,
    namespace: String,
}

impl KubeOrchestrator {
    /// Creates an orchestrator scoped to the given namespace.
    #[must_use]
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            pods: Api::namespaced(client.clone(), &namespace),
            services: Api::namespaced(client.clone(), &namespace),
            config_maps: Api::namespaced(client, &namespace),
            namespace,
        }
    }

    /// Connects using the ambient kubeconfig or in-cluster credentials.
    pub async fn try_default(namespace: impl Into<String>) -> Result<Self, OrchestratorError> {
        let client = Client::try_default().await.map_err(classify)?;
        Ok(Self::new(client, namespace))
    }

    /// The namespace workloads are scheduled into.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub(super) fn pods(&self) -> &Api<Pod> {
        &self.pods
    }

    /// Derives a [`WorkloadStatus`] from a pod, looking at the `main`
    /// container the way a container engine reports state.
    fn pod_status(pod: &Pod) -> WorkloadStatus {
        let Some(status) = &pod.status else {
            return WorkloadStatus::Pending;
        };
        for cs in status.container_statuses.iter().flatten() {
            if cs.name != "main" {
                continue;
            }
            let state = cs.state.as_ref();
            let terminated = state.and_then(|s| s.terminated.as_ref());
            let last = cs
                .last_state
                .as_ref()
                .and_then(|s| s.terminated.as_ref());
            if terminated.map(|t| t.exit_code == 0).unwrap_or(false)
                || last.map(|t| t.exit_code == 0).unwrap_or(false)
            {
                return WorkloadStatus::Completed;
            }
            if let Some(term) = terminated {
                return WorkloadStatus::Failed(format!(
                    "main container exited with code {}",
                    term.exit_code
                ));
            }
            if cs.restart_count > 0 {
                return WorkloadStatus::Failed("main container restarted".to_string());
            }
            if let Some(waiting) = state.and_then(|s| s.waiting.as_ref()) {
                if waiting.reason.as_deref() == Some("ImagePullBackOff")
                    || waiting.reason.as_deref() == Some("ErrImagePull")
                {
                    return WorkloadStatus::Failed("error pulling image".to_string());
                }
            }
            if state.map(|s| s.running.is_some()).unwrap_or(false) {
                return WorkloadStatus::Running;
            }
        }
        if status.phase.as_deref() == Some("Failed") {
            return WorkloadStatus::Failed("pod failed".to_string());
        }
        WorkloadStatus::Pending
    }

    async fn delete_labeled_pods(&self, selector: &str) -> Result<(), OrchestratorError> {
        let lp = ListParams::default().labels(selector);
        let pods = self.pods.list(&lp).await.map_err(classify)?;
        for pod in pods.items {
            let Some(name) = pod.metadata.name else { continue };
            debug!(pod = %name, "deleting pod");
            if let Err(err) = self.pods.delete(&name, &DeleteParams::default()).await {
                if !is_not_found(&err) {
                    return Err(classify(err));
                }
            }
        }
        Ok(())
    }

    async fn delete_labeled_services(&self, selector: &str) -> Result<(), OrchestratorError> {
        let lp = ListParams::default().labels(selector);
        let svcs = self.services.list(&lp).await.map_err(classify)?;
        for svc in svcs.items {
            let Some(name) = svc.metadata.name else { continue };
            debug!(service = %name, "deleting service");
            if let Err(err) = self.services.delete(&name, &DeleteParams::default()).await {
                if !is_not_found(&err) {
                    return Err(classify(err));
                }
            }
        }
        Ok(())
    }

    async fn delete_labeled_config_maps(&self, selector: &str) -> Result<(), OrchestratorError> {
        let lp = ListParams::default().labels(selector);
        let cms = self.config_maps.list(&lp).await.map_err(classify)?;
        for cm in cms.items {
            let Some(name) = cm.metadata.name else { continue };
            debug!(config_map = %name, "deleting config map");
            if let Err(err) = self.config_maps.delete(&name, &DeleteParams::default()).await {
                if !is_not_found(&err) {
                    return Err(classify(err));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn create_pod(&self, pod: &Pod) -> Result<(), OrchestratorError> {
        self.pods
            .create(&PostParams::default(), pod)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn create_config_map(&self, cm: &ConfigMap) -> Result<(), OrchestratorError> {
        self.config_maps
            .create(&PostParams::default(), cm)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn create_service(&self, svc: &Service) -> Result<(), OrchestratorError> {
        self.services
            .create(&PostParams::default(), svc)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn delete_service(&self, name: &str) -> Result<(), OrchestratorError> {
        match self.services.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(classify(err)),
        }
    }

    async fn workload_status(&self, pod_name: &str) -> Result<WorkloadStatus, OrchestratorError> {
        let pod = self.pods.get(pod_name).await.map_err(classify)?;
        Ok(Self::pod_status(&pod))
    }

    async fn delete_labeled(&self, selector: &str) -> Result<(), OrchestratorError> {
        self.delete_labeled_services(selector).await?;
        self.delete_labeled_config_maps(selector).await?;
        self.delete_labeled_pods(selector).await
    }

    async fn count_labeled(&self, selector: &str) -> Result<usize, OrchestratorError> {
        let lp = ListParams::default().labels(selector);
        let pods = self.pods.list(&lp).await.map_err(classify)?.items.len();
        let svcs = self.services.list(&lp).await.map_err(classify)?.items.len();
        let cms = self.config_maps.list(&lp).await.map_err(classify)?.items.len();
        Ok(pods + svcs + cms)
    }

    async fn labeled_values(
        &self,
        selector: &str,
        label: &str,
    ) -> Result<Vec<String>, OrchestratorError> {
        let lp = ListParams::default().labels(selector);
        let mut values = BTreeSet::new();
        let pick = |labels: &Option<std::collections::BTreeMap<String, String>>| {
            labels.as_ref().and_then(|l| l.get(label)).cloned()
        };
        for pod in self.pods.list(&lp).await.map_err(classify)?.items {
            values.extend(pick(&pod.metadata.labels));
        }
        for svc in self.services.list(&lp).await.map_err(classify)?.items {
            values.extend(pick(&svc.metadata.labels));
        }
        for cm in self.config_maps.list(&lp).await.map_err(classify)?.items {
            values.extend(pick(&cm.metadata.labels));
        }
        Ok(values.into_iter().collect())
    }

    async fn exec(
        &self,
        pod_name: &str,
        cmd: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecOutput, OrchestratorError> {
        self.exec_in_pod(pod_name, cmd, stdin).await
    }

    async fn log_stream(
        &self,
        pod_name: &str,
        follow: bool,
        tail_lines: Option<i64>,
    ) -> Result<LogStream, OrchestratorError> {
        self.open_log_stream(pod_name, follow, tail_lines).await
    }

    async fn forward_port(
        &self,
        pod_name: &str,
        pod_port: u16,
        conn: TcpStream,
    ) -> Result<(), OrchestratorError> {
        self.forward_connection(pod_name, pod_port, conn).await
    }
}

//! Archive copy in and out of a running workload.
//!
//! Both directions ride on the exec channel and require `tar` to be
//! present in the image, which holds for the busybox-style images test
//! containers are built from.

use tracing::info;

use super::Orchestrator;
use crate::error::OrchestratorError;

/// Extracts a tar archive at `target` inside the workload.
pub async fn copy_archive_to(
    orch: &dyn Orchestrator,
    pod_name: &str,
    archive: Vec<u8>,
    target: &str,
) -> Result<(), OrchestratorError> {
    let target = if target != "/" {
        target.trim_end_matches('/')
    } else {
        target
    };
    info!(pod = %pod_name, target, bytes = archive.len(), "copying archive into workload");
    let cmd = ["tar", "-xf", "-", "-C", target].map(String::from);
    let out = orch.exec(pod_name, &cmd, Some(archive)).await?;
    if out.exit_code != 0 {
        return Err(OrchestratorError::fatal(format!(
            "tar extract in {target} failed with code {}: {}",
            out.exit_code,
            String::from_utf8_lossy(&out.stderr)
        )));
    }
    Ok(())
}

/// Packs `path` inside the workload into a tar archive.
pub async fn copy_archive_from(
    orch: &dyn Orchestrator,
    pod_name: &str,
    path: &str,
) -> Result<Vec<u8>, OrchestratorError> {
    let trimmed = path.trim_end_matches('/');
    let (dir, base) = if trimmed.is_empty() {
        // the root itself: tar everything relative to /
        ("/".to_string(), ".".to_string())
    } else {
        match trimmed.rsplit_once('/') {
            Some((dir, base)) if !dir.is_empty() => (dir.to_string(), base.to_string()),
            _ => ("/".to_string(), trimmed.trim_start_matches('/').to_string()),
        }
    };
    let cmd = ["tar", "-cf", "-", "-C", &dir, &base].map(String::from);
    let out = orch.exec(pod_name, &cmd, None).await?;
    if out.exit_code != 0 {
        return Err(OrchestratorError::fatal(format!(
            "tar create for {path} failed with code {}: {}",
            out.exit_code,
            String::from_utf8_lossy(&out.stderr)
        )));
    }
    Ok(out.stdout)
}

/// True if `path` exists inside the workload.
pub async fn path_exists(
    orch: &dyn Orchestrator,
    pod_name: &str,
    path: &str,
) -> Result<bool, OrchestratorError> {
    // path is interpolated into a shell word, strip metacharacters
    let clean: String = path
        .chars()
        .filter(|c| !matches!(c, '`' | '$' | '"' | '\\' | ';'))
        .collect();
    let script = format!("test -e \"{clean}\"");
    let cmd = ["sh".to_string(), "-c".to_string(), script];
    let out = orch.exec(pod_name, &cmd, None).await?;
    Ok(out.exit_code == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube::mock::MockOrchestrator;

    #[tokio::test]
    async fn test_copy_archive_to_strips_trailing_slash() {
        let orch = MockOrchestrator::new();
        copy_archive_to(&orch, "pod-1", vec![1, 2, 3], "/data/").await.unwrap();
        let execs = orch.recorded_execs();
        assert_eq!(execs.len(), 1);
        assert_eq!(execs[0], vec!["tar", "-xf", "-", "-C", "/data"]);
    }

    #[tokio::test]
    async fn test_copy_archive_from_splits_path() {
        let orch = MockOrchestrator::new();
        copy_archive_from(&orch, "pod-1", "/var/log/app.log").await.unwrap();
        let execs = orch.recorded_execs();
        assert_eq!(execs[0], vec!["tar", "-cf", "-", "-C", "/var/log", "app.log"]);
    }

    #[tokio::test]
    async fn test_copy_archive_from_root_path() {
        let orch = MockOrchestrator::new();
        copy_archive_from(&orch, "pod-1", "/").await.unwrap();
        let execs = orch.recorded_execs();
        assert_eq!(execs[0], vec!["tar", "-cf", "-", "-C", "/", "."]);
    }

    #[tokio::test]
    async fn test_path_exists_strips_metacharacters() {
        let orch = MockOrchestrator::new();
        path_exists(&orch, "pod-1", "/tmp/$(boom)").await.unwrap();
        let execs = orch.recorded_execs();
        assert!(execs[0][2].contains("/tmp/(boom)"));
        assert!(!execs[0][2].contains('$'));
    }
}

use super::{Layer, Plan, Supervisor, SupervisorError};
use async_trait::async_trait;
use log::{debug, info};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::process::Command;

/// Supervisor backed by the local filesystem.
///
/// Files are pushed below `root`, layers are kept as JSON documents in
/// `layers_dir` (merged in file name order), and a replan runs the optional
/// reload command. The layer directory doubles as the readiness signal:
/// until it exists the supervisor is reported as unavailable.
///
/// A service counts as running when it is in the plan and the optional
/// status command (run with the service name appended) exits successfully.
pub struct LocalSupervisor {
    root: PathBuf,
    layers_dir: PathBuf,
    reload_command: Vec<String>,
    status_command: Vec<String>,
}

impl LocalSupervisor {
    pub fn new(root: PathBuf, layers_dir: PathBuf, reload_command: Vec<String>) -> Self {
        Self {
            root,
            layers_dir,
            reload_command,
            status_command: Vec::new(),
        }
    }

    pub fn with_status_command(mut self, status_command: Vec<String>) -> Self {
        self.status_command = status_command;
        self
    }

    fn workload_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    async fn check_ready(&self) -> Result<(), SupervisorError> {
        match fs::metadata(&self.layers_dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(SupervisorError::Unavailable(format!(
                "{} is not a directory",
                self.layers_dir.display()
            ))),
            Err(e) => Err(SupervisorError::Unavailable(format!(
                "{}: {}",
                self.layers_dir.display(),
                e
            ))),
        }
    }

    async fn read_layer(path: &Path) -> Result<Layer, SupervisorError> {
        let bytes = fs::read(path).await.map_err(|source| io_error("read", path, source))?;
        serde_json::from_slice(&bytes).map_err(|source| SupervisorError::Layer {
            path: path.display().to_string(),
            source,
        })
    }
}

fn io_error(op: &'static str, path: &Path, source: io::Error) -> SupervisorError {
    SupervisorError::Io {
        op,
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl Supervisor for LocalSupervisor {
    async fn current_plan(&self) -> Result<Plan, SupervisorError> {
        self.check_ready().await?;

        let mut entries = fs::read_dir(&self.layers_dir)
            .await
            .map_err(|source| io_error("list", &self.layers_dir, source))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| io_error("list", &self.layers_dir, source))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                files.push(path);
            }
        }
        files.sort();

        let mut plan = Plan::default();
        for path in files {
            let layer = Self::read_layer(&path).await?;
            plan.apply_layer(&layer);
        }
        Ok(plan)
    }

    async fn push_file(&self, path: &str, content: &str) -> Result<(), SupervisorError> {
        self.check_ready().await?;
        let target = self.workload_path(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| io_error("create", parent, source))?;
        }
        fs::write(&target, content)
            .await
            .map_err(|source| io_error("write", &target, source))?;
        debug!("Pushed {} ({} bytes)", target.display(), content.len());
        Ok(())
    }

    async fn ensure_dir(&self, path: &str) -> Result<(), SupervisorError> {
        self.check_ready().await?;
        let target = self.workload_path(path);
        fs::create_dir_all(&target)
            .await
            .map_err(|source| io_error("create", &target, source))
    }

    async fn add_layer(&self, name: &str, layer: &Layer) -> Result<(), SupervisorError> {
        self.check_ready().await?;
        let target = self.layers_dir.join(format!("{name}.json"));
        let bytes = serde_json::to_vec_pretty(layer).map_err(|source| SupervisorError::Layer {
            path: target.display().to_string(),
            source,
        })?;
        fs::write(&target, bytes)
            .await
            .map_err(|source| io_error("write", &target, source))?;
        info!("Registered layer {}", name);
        Ok(())
    }

    async fn replan(&self) -> Result<(), SupervisorError> {
        self.check_ready().await?;
        let Some((program, args)) = self.reload_command.split_first() else {
            debug!("No reload command configured, replan is a no-op");
            return Ok(());
        };

        let status = Command::new(program)
            .args(args)
            .status()
            .await
            .map_err(|e| SupervisorError::Replan(format!("{program}: {e}")))?;
        if !status.success() {
            return Err(SupervisorError::Replan(format!(
                "{program} exited with {status}"
            )));
        }
        info!("Replan completed");
        Ok(())
    }

    async fn service_running(&self, name: &str) -> Result<bool, SupervisorError> {
        if !self.current_plan().await?.services.contains_key(name) {
            return Ok(false);
        }
        let Some((program, args)) = self.status_command.split_first() else {
            return Ok(true);
        };

        let status = Command::new(program)
            .args(args)
            .arg(name)
            .status()
            .await
            .map_err(|e| SupervisorError::Unavailable(format!("{program}: {e}")))?;
        debug!("{} status for {}: {}", program, name, status);
        Ok(status.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::{Override, RestartPolicy, ServiceDescriptor, Startup};
    use std::collections::BTreeMap;

    fn sample_layer(command: &str) -> Layer {
        let mut services = BTreeMap::new();
        services.insert(
            "content-cache".to_string(),
            ServiceDescriptor {
                override_mode: Override::Replace,
                summary: "content-cache".into(),
                command: command.into(),
                startup: Startup::Enabled,
                on_failure: RestartPolicy::Restart,
                environment: BTreeMap::new(),
            },
        );
        Layer {
            summary: "layer".into(),
            description: "layer".into(),
            services,
            checks: BTreeMap::new(),
        }
    }

    fn supervisor(dir: &Path, reload: Vec<String>) -> LocalSupervisor {
        LocalSupervisor::new(dir.join("root"), dir.join("layers"), reload)
    }

    #[tokio::test]
    async fn missing_layer_dir_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), Vec::new());

        let err = sup.current_plan().await.unwrap_err();
        assert!(matches!(err, SupervisorError::Unavailable(_)));
        let err = sup.push_file("/etc/x", "y").await.unwrap_err();
        assert!(matches!(err, SupervisorError::Unavailable(_)));
    }

    #[tokio::test]
    async fn added_layers_show_up_in_the_plan() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("layers")).unwrap();
        let sup = supervisor(dir.path(), Vec::new());

        assert!(sup.current_plan().await.unwrap().services.is_empty());

        sup.add_layer("content-cache", &sample_layer("nginx")).await.unwrap();
        let plan = sup.current_plan().await.unwrap();
        assert_eq!(plan.services["content-cache"].command, "nginx");
    }

    #[tokio::test]
    async fn files_are_pushed_below_the_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("layers")).unwrap();
        let sup = supervisor(dir.path(), Vec::new());

        sup.push_file("/etc/nginx/sites-enabled/default", "server {}")
            .await
            .unwrap();
        sup.ensure_dir("/var/lib/nginx/proxy/cache").await.unwrap();

        let pushed = dir.path().join("root/etc/nginx/sites-enabled/default");
        assert_eq!(std::fs::read_to_string(pushed).unwrap(), "server {}");
        assert!(dir.path().join("root/var/lib/nginx/proxy/cache").is_dir());
    }

    #[tokio::test]
    async fn service_state_follows_plan_and_status_command() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("layers")).unwrap();
        let sup = supervisor(dir.path(), Vec::new());

        assert!(!sup.service_running("content-cache").await.unwrap());
        sup.add_layer("content-cache", &sample_layer("nginx")).await.unwrap();
        assert!(sup.service_running("content-cache").await.unwrap());

        let stopped = supervisor(dir.path(), Vec::new()).with_status_command(vec!["false".into()]);
        assert!(!stopped.service_running("content-cache").await.unwrap());
        let up = supervisor(dir.path(), Vec::new()).with_status_command(vec!["true".into()]);
        assert!(up.service_running("content-cache").await.unwrap());
    }

    #[tokio::test]
    async fn failing_reload_command_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("layers")).unwrap();

        let ok = supervisor(dir.path(), vec!["true".into()]);
        assert!(ok.replan().await.is_ok());

        let failing = supervisor(dir.path(), vec!["false".into()]);
        let err = failing.replan().await.unwrap_err();
        assert!(matches!(err, SupervisorError::Replan(_)));
    }
}

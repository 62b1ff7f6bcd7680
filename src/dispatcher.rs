//! Event dispatch around the reconciler.
//!
//! Triggers are handled one at a time. Before each one the stored state is
//! loaded and a fresh [`ConfigSnapshot`] captured; afterwards the state the
//! reconciler hands back is persisted together with the deferred queue.
//! Deferred triggers are delivered again after the reconciler's back-off.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::ingress::{FileIngressPublisher, IngressPublisher};
use crate::reconciler::{Reconciler, ReconcilerConfig, Transition};
use crate::snapshot::ConfigSnapshot;
use crate::state::StoredState;
use crate::supervisor::{LocalSupervisor, Supervisor};
use crate::types::{ActionName, Trigger, UnitStatus};
use crate::visits;

#[derive(Debug)]
pub enum Outcome {
    Reconciled(Transition),
    /// Output of an operator action.
    Report(String),
}

pub struct Dispatcher {
    config: Config,
    supervisor: Arc<dyn Supervisor>,
    ingress: Arc<dyn IngressPublisher>,
    reconciler: Reconciler,
}

fn reconciler_for(
    config: &Config,
    supervisor: &Arc<dyn Supervisor>,
    ingress: &Arc<dyn IngressPublisher>,
) -> Reconciler {
    Reconciler::new(
        Arc::clone(supervisor),
        Arc::clone(ingress),
        ReconcilerConfig {
            retry_after: config.retry_after(),
        },
    )
}

impl Dispatcher {
    pub fn new(
        config: Config,
        supervisor: Arc<dyn Supervisor>,
        ingress: Arc<dyn IngressPublisher>,
    ) -> Self {
        let reconciler = reconciler_for(&config, &supervisor, &ingress);
        Self {
            config,
            supervisor,
            ingress,
            reconciler,
        }
    }

    /// Wires the local supervisor and the file-backed ingress publisher.
    pub fn from_config(config: Config) -> Self {
        let supervisor: Arc<dyn Supervisor> = Arc::new(
            LocalSupervisor::new(
                config.supervisor.root.clone(),
                config.supervisor.layers_dir.clone(),
                config.supervisor.reload_command.clone(),
            )
            .with_status_command(config.supervisor.status_command.clone()),
        );
        let ingress: Arc<dyn IngressPublisher> =
            Arc::new(FileIngressPublisher::new(config.paths.ingress_file.clone()));
        Self::new(config, supervisor, ingress)
    }

    #[cfg(test)]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Swaps in a reloaded configuration. Collaborator locations are fixed
    /// for the lifetime of the process.
    pub fn reload(&mut self, config: Config) {
        if config.supervisor.layers_dir != self.config.supervisor.layers_dir
            || config.paths.ingress_file != self.config.paths.ingress_file
        {
            warn!("Supervisor and ingress locations only change on restart");
        }
        self.reconciler = reconciler_for(&config, &self.supervisor, &self.ingress);
        self.config = config;
    }

    /// Handles one trigger to completion.
    pub async fn dispatch(&self, trigger: Trigger) -> anyhow::Result<Outcome> {
        match trigger {
            Trigger::ActionInvoked(action) => self.run_action(action).map(Outcome::Report),
            lifecycle => self.reconcile(lifecycle).await.map(Outcome::Reconciled),
        }
    }

    fn run_action(&self, action: ActionName) -> anyhow::Result<String> {
        info!("Running action {}", action.as_str());
        match action {
            ActionName::ReportVisitsByIp => {
                let now = Utc::now();
                visits::report_visits_by_ip(&self.config.paths.access_log, now)
                    .with_context(|| format!("{} failed", action.as_str()))
            }
        }
    }

    async fn reconcile(&self, trigger: Trigger) -> anyhow::Result<Transition> {
        let state_file = &self.config.paths.state_file;
        let mut stored = StoredState::load(state_file).await?;
        stored.set_status(&UnitStatus::Maintenance(format!(
            "Configuring workload container ({trigger})"
        )));
        stored.save(state_file).await?;

        let snapshot = ConfigSnapshot::capture(&self.config, &stored);
        let mut transition = self.reconciler.reconcile(trigger, &snapshot).await;

        let mut deferred = stored.deferred();
        deferred.retain(|t| *t != trigger);
        if transition.is_deferred() {
            deferred.push(trigger);
        }
        transition.stored.set_deferred(&deferred);
        transition.stored.save(state_file).await?;

        debug!("{} went through {:?}", trigger, transition.path);
        info!("{} finished in {:?}: {}", trigger, transition.phase, transition.status);
        Ok(transition)
    }

    /// Triggers left deferred by a previous process.
    pub async fn pending(&self) -> anyhow::Result<Vec<Trigger>> {
        Ok(StoredState::load(&self.config.paths.state_file).await?.deferred())
    }

    /// Long-running loop. Reloads `config_path` on SIGHUP and exits on
    /// Ctrl+C.
    pub async fn run(mut self, config_path: Option<PathBuf>) -> anyhow::Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Trigger>();
        let mut scheduled: HashSet<Trigger> = HashSet::new();

        tx.send(Trigger::UpgradeCharm)?;
        for trigger in self.pending().await? {
            if trigger != Trigger::UpgradeCharm {
                tx.send(trigger)?;
            }
        }

        let mut hangup = unix_signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
        let shutdown = signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                Some(trigger) = rx.recv() => {
                    scheduled.remove(&trigger);
                    match self.dispatch(trigger).await {
                        Ok(Outcome::Reconciled(transition)) => {
                            if let Some(delay) = transition.retry_after {
                                if scheduled.insert(trigger) {
                                    let tx = tx.clone();
                                    tokio::spawn(async move {
                                        tokio::time::sleep(delay).await;
                                        let _ = tx.send(trigger);
                                    });
                                }
                            }
                        }
                        Ok(Outcome::Report(report)) => info!("{}\n{}", trigger, report),
                        Err(e) => error!("Handling {} failed: {:#}", trigger, e),
                    }
                }
                _ = hangup.recv() => {
                    info!("Received SIGHUP, reloading configuration");
                    match Config::load(config_path.as_deref()) {
                        Ok(config) => {
                            self.reload(config);
                            tx.send(Trigger::ConfigChanged)?;
                        }
                        Err(e) => error!("Keeping previous configuration: {:#}", e),
                    }
                }
                res = &mut shutdown => {
                    match res {
                        Ok(()) => info!("Received Ctrl+C, shutting down..."),
                        Err(err) => error!("Unable to listen for shutdown signal: {}", err),
                    }
                    break;
                }
            }
        }

        info!("Shutdown complete.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::tests::{RecordingIngress, RecordingSupervisor};
    use crate::reconciler::Phase;
    use std::path::Path;

    fn config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.charm.backend = "http://mybackend.local:80".into();
        config.charm.site = "mysite.local".into();
        config.paths.state_file = dir.join("state.json");
        config.paths.access_log = dir.join("access.log");
        config
    }

    fn dispatcher(config: Config) -> (Dispatcher, Arc<RecordingSupervisor>) {
        let supervisor = Arc::new(RecordingSupervisor::default());
        let ingress = Arc::new(RecordingIngress::default());
        (Dispatcher::new(config, supervisor.clone(), ingress), supervisor)
    }

    fn transition(outcome: Outcome) -> Transition {
        match outcome {
            Outcome::Reconciled(t) => t,
            Outcome::Report(r) => panic!("unexpected report: {r}"),
        }
    }

    #[tokio::test]
    async fn lifecycle_trigger_persists_status() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _) = dispatcher(config(dir.path()));

        let t = transition(dispatcher.dispatch(Trigger::ConfigChanged).await.unwrap());
        assert_eq!(t.phase, Phase::Ready);

        let stored = StoredState::load(&dir.path().join("state.json")).await.unwrap();
        assert_eq!(stored.status(), UnitStatus::Active("Ready".into()));
        assert!(stored.deferred().is_empty());
        assert!(stored.published_ingress().is_some());
    }

    #[tokio::test]
    async fn deferred_trigger_is_queued_until_it_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, supervisor) = dispatcher(config(dir.path()));
        *supervisor.unavailable.lock().unwrap() = true;

        let t = transition(dispatcher.dispatch(Trigger::ConfigChanged).await.unwrap());
        assert!(t.is_deferred());
        assert_eq!(dispatcher.pending().await.unwrap(), vec![Trigger::ConfigChanged]);

        // Deferring again does not duplicate the entry.
        dispatcher.dispatch(Trigger::ConfigChanged).await.unwrap();
        assert_eq!(dispatcher.pending().await.unwrap(), vec![Trigger::ConfigChanged]);

        *supervisor.unavailable.lock().unwrap() = false;
        let t = transition(dispatcher.dispatch(Trigger::ConfigChanged).await.unwrap());
        assert_eq!(t.phase, Phase::Ready);
        assert!(dispatcher.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_state_file_does_not_wedge_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("state.json"), "{ truncated").unwrap();
        let (dispatcher, _) = dispatcher(config(dir.path()));

        let t = transition(dispatcher.dispatch(Trigger::ConfigChanged).await.unwrap());
        assert_eq!(t.phase, Phase::Ready);

        let stored = StoredState::read(&dir.path().join("state.json")).await.unwrap();
        assert_eq!(stored.status(), UnitStatus::Active("Ready".into()));
    }

    #[tokio::test]
    async fn blocked_config_is_not_deferred() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.charm.backend = String::new();
        let (dispatcher, supervisor) = dispatcher(cfg);

        let t = transition(dispatcher.dispatch(Trigger::UpgradeCharm).await.unwrap());
        assert_eq!(t.phase, Phase::Blocked);
        assert!(dispatcher.pending().await.unwrap().is_empty());
        assert!(supervisor.calls().is_empty());
    }

    #[tokio::test]
    async fn reload_picks_up_new_settings() {
        let dir = tempfile::tempdir().unwrap();
        let (mut dispatcher, supervisor) = dispatcher(config(dir.path()));
        dispatcher.dispatch(Trigger::ConfigChanged).await.unwrap();

        let mut cfg = config(dir.path());
        cfg.charm.cache_max_size = "20G".into();
        dispatcher.reload(cfg);
        let t = transition(dispatcher.dispatch(Trigger::ConfigChanged).await.unwrap());

        assert!(t.applied);
        assert_eq!(dispatcher.config().charm.cache_max_size, "20G");
        let plan = supervisor.plan.lock().unwrap().clone();
        assert_eq!(
            plan.services["content-cache"].environment["NGINX_CACHE_MAX_SIZE"],
            "20G"
        );
    }

    #[tokio::test]
    async fn action_reports_visits_without_touching_state() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let line = format!(
            "10.1.2.3 - - [{}] \"GET / HTTP/1.1\" 200 612 \"-\" \"curl/8.0\"\n",
            now.format("%d/%b/%Y:%H:%M:%S")
        );
        std::fs::write(dir.path().join("access.log"), line).unwrap();
        let (dispatcher, supervisor) = dispatcher(config(dir.path()));

        let outcome = dispatcher
            .dispatch(Trigger::ActionInvoked(ActionName::ReportVisitsByIp))
            .await
            .unwrap();

        match outcome {
            Outcome::Report(table) => assert!(table.contains("10.1.2.3")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(supervisor.calls().is_empty());
        assert!(!dir.path().join("state.json").exists());
    }

    #[tokio::test]
    async fn action_failure_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _) = dispatcher(config(dir.path()));

        let err = dispatcher
            .dispatch(Trigger::ActionInvoked(ActionName::ReportVisitsByIp))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("report-visits-by-ip failed"));
    }
}

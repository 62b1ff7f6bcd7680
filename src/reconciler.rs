//! Reconciliation state machine.
//!
//! One call to [`Reconciler::reconcile`] handles one trigger:
//!
//! ```text
//! Idle -> Validating -> Blocked
//!                    -> Waiting (deferred)
//!                    -> Planning -> Waiting (deferred)
//!                                -> Ready (no drift, service up)
//!                                -> Applying -> Ready
//!                                            -> Waiting (deferred)
//! ```
//!
//! The machine never sleeps or retries by itself. A deferral is reported
//! through [`Transition::retry_after`] and the dispatcher decides when to
//! deliver the trigger again.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::ingress::{IngressError, IngressPublisher};
use crate::plan::{self, DesiredPlan, CONTAINER_NAME};
use crate::snapshot::ConfigSnapshot;
use crate::state::StoredState;
use crate::supervisor::{Supervisor, SupervisorError};
use crate::types::{Trigger, UnitStatus};

pub const SUPERVISOR_NOT_READY: &str = "Supervisor is not ready, deferring event";
pub const READY: &str = "Ready";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Validating,
    Blocked,
    Waiting,
    Planning,
    Applying,
    Ready,
}

/// Result of handling one trigger.
#[derive(Debug, Clone)]
pub struct Transition {
    /// Where the machine stopped for this trigger.
    pub phase: Phase,
    /// Phases visited, starting with `Idle`.
    pub path: Vec<Phase>,
    pub status: UnitStatus,
    /// Set when the trigger must be delivered again later.
    pub retry_after: Option<Duration>,
    /// Whether a new layer was handed to the supervisor.
    pub applied: bool,
    /// Stored state to persist after this trigger.
    pub stored: StoredState,
}

impl Transition {
    pub fn is_deferred(&self) -> bool {
        self.retry_after.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Back-off suggested to the dispatcher for deferred triggers.
    pub retry_after: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            retry_after: Duration::from_secs(5),
        }
    }
}

pub struct Reconciler {
    supervisor: Arc<dyn Supervisor>,
    ingress: Arc<dyn IngressPublisher>,
    config: ReconcilerConfig,
}

/// Accumulates the walk through the machine for one trigger.
struct Run {
    path: Vec<Phase>,
    stored: StoredState,
}

impl Run {
    fn enter(&mut self, phase: Phase) {
        debug!("Entering {:?}", phase);
        self.path.push(phase);
    }

    fn finish(
        mut self,
        phase: Phase,
        status: UnitStatus,
        retry_after: Option<Duration>,
        applied: bool,
    ) -> Transition {
        if self.path.last() != Some(&phase) {
            self.path.push(phase);
        }
        self.stored.set_status(&status);
        Transition {
            phase,
            path: self.path,
            status,
            retry_after,
            applied,
            stored: self.stored,
        }
    }
}

impl Reconciler {
    pub fn new(
        supervisor: Arc<dyn Supervisor>,
        ingress: Arc<dyn IngressPublisher>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            supervisor,
            ingress,
            config,
        }
    }

    pub async fn reconcile(&self, trigger: Trigger, snapshot: &ConfigSnapshot) -> Transition {
        let mut run = Run {
            path: vec![Phase::Idle],
            stored: snapshot.stored.clone(),
        };

        if let Trigger::ActionInvoked(action) = trigger {
            debug!("{} is an action, nothing to reconcile", action.as_str());
            let status = snapshot.stored.status();
            return run.finish(Phase::Idle, status, None, false);
        }

        info!("Configuring workload container ({})", trigger);
        run.enter(Phase::Validating);
        let desired = match plan::build(snapshot) {
            Ok(desired) => desired,
            Err(err) if err.is_retryable() => {
                warn!("{}, deferring {}", err, trigger);
                return self.defer(run, err.to_string());
            }
            Err(err) => {
                warn!("{}", err);
                return run.finish(Phase::Blocked, UnitStatus::Blocked(err.to_string()), None, false);
            }
        };

        if let Err(err) = self.publish_ingress(&desired, &mut run.stored).await {
            error!("Failed to publish ingress data: {}", err);
            return self.defer(run, format!("Waiting for ingress: {err}"));
        }

        run.enter(Phase::Planning);
        let live = match self.supervisor.current_plan().await {
            Ok(live) => live,
            Err(err) => {
                warn!("Cannot read current plan: {}", err);
                return self.defer(run, SUPERVISOR_NOT_READY.to_string());
            }
        };

        if live == desired.service_plan() {
            let running = match self.supervisor.service_running(CONTAINER_NAME).await {
                Ok(running) => running,
                Err(err) => {
                    warn!("Cannot read service state: {}", err);
                    return self.defer(run, SUPERVISOR_NOT_READY.to_string());
                }
            };
            if running {
                info!("Supervisor plan is up to date, nothing to apply");
                return run.finish(Phase::Ready, UnitStatus::Active(READY.into()), None, false);
            }

            run.enter(Phase::Applying);
            warn!("{} is not running, restarting it", CONTAINER_NAME);
            if let Err(err) = self.supervisor.replan().await {
                error!("Restarting {} failed: {}", CONTAINER_NAME, err);
                return self.defer(run, SUPERVISOR_NOT_READY.to_string());
            }
            return run.finish(Phase::Ready, UnitStatus::Active(READY.into()), None, false);
        }

        run.enter(Phase::Applying);
        if let Err(err) = self.apply(&desired).await {
            error!("Applying plan failed: {}", err);
            return self.defer(run, SUPERVISOR_NOT_READY.to_string());
        }

        info!("Done applying updated plan");
        run.finish(Phase::Ready, UnitStatus::Active(READY.into()), None, true)
    }

    fn defer(&self, run: Run, message: String) -> Transition {
        run.finish(
            Phase::Waiting,
            UnitStatus::Waiting(message),
            Some(self.config.retry_after),
            false,
        )
    }

    /// Hands the ingress data to the provider unless it already has it.
    async fn publish_ingress(
        &self,
        desired: &DesiredPlan,
        stored: &mut StoredState,
    ) -> Result<(), IngressError> {
        if stored.published_ingress().as_ref() == Some(&desired.ingress) {
            return Ok(());
        }
        self.ingress.publish(&desired.ingress).await?;
        stored.set_published_ingress(&desired.ingress);
        Ok(())
    }

    async fn apply(&self, desired: &DesiredPlan) -> Result<(), SupervisorError> {
        debug!("Applying plan with {} environment settings", desired.env.len());
        self.supervisor
            .push_file(&desired.site_config_path, &desired.proxy_config_text)
            .await?;
        self.supervisor.ensure_dir(&desired.cache_path).await?;
        self.supervisor.add_layer(CONTAINER_NAME, &desired.layer).await?;
        self.supervisor.replan().await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ingress::IngressConfig;
    use crate::plan::tests::base_snapshot;
    use crate::snapshot::PeerRelation;
    use crate::supervisor::{Layer, Plan};
    use crate::types::ActionName;
    use async_trait::async_trait;
    use std::io;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Call {
        PushFile(String),
        EnsureDir(String),
        AddLayer(String),
        Replan,
    }

    /// In-memory supervisor that records every mutation.
    #[derive(Default)]
    pub(crate) struct RecordingSupervisor {
        pub plan: Mutex<Plan>,
        pub calls: Mutex<Vec<Call>>,
        pub unavailable: Mutex<bool>,
        pub fail_push: Mutex<bool>,
        pub stopped: Mutex<bool>,
    }

    impl RecordingSupervisor {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn check(&self) -> Result<(), SupervisorError> {
            if *self.unavailable.lock().unwrap() {
                return Err(SupervisorError::Unavailable("socket missing".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Supervisor for RecordingSupervisor {
        async fn current_plan(&self) -> Result<Plan, SupervisorError> {
            self.check()?;
            Ok(self.plan.lock().unwrap().clone())
        }

        async fn push_file(&self, path: &str, _content: &str) -> Result<(), SupervisorError> {
            self.check()?;
            if *self.fail_push.lock().unwrap() {
                return Err(SupervisorError::Io {
                    op: "write",
                    path: path.into(),
                    source: io::Error::new(io::ErrorKind::BrokenPipe, "connection reset"),
                });
            }
            self.calls.lock().unwrap().push(Call::PushFile(path.into()));
            Ok(())
        }

        async fn ensure_dir(&self, path: &str) -> Result<(), SupervisorError> {
            self.check()?;
            self.calls.lock().unwrap().push(Call::EnsureDir(path.into()));
            Ok(())
        }

        async fn add_layer(&self, name: &str, layer: &Layer) -> Result<(), SupervisorError> {
            self.check()?;
            self.plan.lock().unwrap().apply_layer(layer);
            self.calls.lock().unwrap().push(Call::AddLayer(name.into()));
            Ok(())
        }

        async fn replan(&self) -> Result<(), SupervisorError> {
            self.check()?;
            *self.stopped.lock().unwrap() = false;
            self.calls.lock().unwrap().push(Call::Replan);
            Ok(())
        }

        async fn service_running(&self, name: &str) -> Result<bool, SupervisorError> {
            self.check()?;
            let known = self.plan.lock().unwrap().services.contains_key(name);
            Ok(known && !*self.stopped.lock().unwrap())
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingIngress {
        pub published: Mutex<Vec<IngressConfig>>,
        pub fail: Mutex<bool>,
    }

    #[async_trait]
    impl IngressPublisher for RecordingIngress {
        async fn publish(&self, config: &IngressConfig) -> Result<(), IngressError> {
            if *self.fail.lock().unwrap() {
                return Err(IngressError::Io {
                    path: "ingress.json".into(),
                    source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
                });
            }
            self.published.lock().unwrap().push(config.clone());
            Ok(())
        }
    }

    fn setup() -> (Reconciler, Arc<RecordingSupervisor>, Arc<RecordingIngress>) {
        let supervisor = Arc::new(RecordingSupervisor::default());
        let ingress = Arc::new(RecordingIngress::default());
        let reconciler = Reconciler::new(
            supervisor.clone(),
            ingress.clone(),
            ReconcilerConfig::default(),
        );
        (reconciler, supervisor, ingress)
    }

    /// Carries the stored state forward the way the dispatcher does.
    fn next_snapshot(snapshot: &ConfigSnapshot, transition: &Transition) -> ConfigSnapshot {
        ConfigSnapshot {
            stored: transition.stored.clone(),
            ..snapshot.clone()
        }
    }

    #[tokio::test]
    async fn fresh_unit_applies_the_plan() {
        let (reconciler, supervisor, ingress) = setup();

        let t = reconciler.reconcile(Trigger::ConfigChanged, &base_snapshot()).await;

        assert_eq!(t.phase, Phase::Ready);
        assert_eq!(
            t.path,
            vec![
                Phase::Idle,
                Phase::Validating,
                Phase::Planning,
                Phase::Applying,
                Phase::Ready
            ]
        );
        assert_eq!(t.status, UnitStatus::Active("Ready".into()));
        assert!(t.applied);
        assert!(!t.is_deferred());
        assert_eq!(
            supervisor.calls(),
            vec![
                Call::PushFile("/etc/nginx/sites-enabled/default".into()),
                Call::EnsureDir("/var/lib/nginx/proxy/cache".into()),
                Call::AddLayer("content-cache".into()),
                Call::Replan,
            ]
        );
        assert_eq!(ingress.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_run_without_drift_mutates_nothing() {
        let (reconciler, supervisor, ingress) = setup();
        let snapshot = base_snapshot();

        let first = reconciler.reconcile(Trigger::ConfigChanged, &snapshot).await;
        let writes = supervisor.calls().len();

        let second = reconciler
            .reconcile(Trigger::UpgradeCharm, &next_snapshot(&snapshot, &first))
            .await;

        assert_eq!(second.phase, Phase::Ready);
        assert!(!second.applied);
        assert_eq!(supervisor.calls().len(), writes);
        assert_eq!(ingress.published.lock().unwrap().len(), 1);
        assert_eq!(
            second.path,
            vec![Phase::Idle, Phase::Validating, Phase::Planning, Phase::Ready]
        );
    }

    #[tokio::test]
    async fn stopped_service_is_restarted_without_rewriting_the_plan() {
        let (reconciler, supervisor, _) = setup();
        let snapshot = base_snapshot();
        let first = reconciler.reconcile(Trigger::ConfigChanged, &snapshot).await;
        let writes = supervisor.calls().len();

        *supervisor.stopped.lock().unwrap() = true;
        let t = reconciler
            .reconcile(Trigger::ConfigChanged, &next_snapshot(&snapshot, &first))
            .await;

        assert_eq!(t.phase, Phase::Ready);
        assert!(!t.applied);
        assert!(t.path.contains(&Phase::Applying));
        assert_eq!(supervisor.calls().len(), writes + 1);
        assert_eq!(supervisor.calls().last(), Some(&Call::Replan));
        assert!(!*supervisor.stopped.lock().unwrap());
    }

    #[tokio::test]
    async fn config_change_reapplies() {
        let (reconciler, supervisor, _) = setup();
        let snapshot = base_snapshot();
        let first = reconciler.reconcile(Trigger::ConfigChanged, &snapshot).await;

        let mut changed = next_snapshot(&snapshot, &first);
        changed.charm.cache_max_size = "20G".into();
        let second = reconciler.reconcile(Trigger::ConfigChanged, &changed).await;

        assert!(second.applied);
        assert_eq!(supervisor.calls().len(), 8);
        let plan = supervisor.plan.lock().unwrap().clone();
        assert_eq!(
            plan.services["content-cache"].environment["NGINX_CACHE_MAX_SIZE"],
            "20G"
        );
    }

    #[tokio::test]
    async fn missing_backend_blocks() {
        let (reconciler, supervisor, ingress) = setup();
        let mut snapshot = base_snapshot();
        snapshot.charm.backend = String::new();

        let t = reconciler.reconcile(Trigger::ConfigChanged, &snapshot).await;

        assert_eq!(t.phase, Phase::Blocked);
        assert_eq!(
            t.status,
            UnitStatus::Blocked("Required config(s) empty: backend".into())
        );
        assert!(!t.is_deferred());
        assert!(supervisor.calls().is_empty());
        assert!(ingress.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn bad_time_format_blocks_with_details() {
        let (reconciler, supervisor, _) = setup();
        let mut snapshot = base_snapshot();
        snapshot.charm.proxy_cache_lock_age = "5".into();

        let t = reconciler.reconcile(Trigger::ConfigChanged, &snapshot).await;

        assert_eq!(t.phase, Phase::Blocked);
        assert!(t.status.message().contains("proxy_cache_lock_age"));
        assert!(t.status.message().contains("\"5\""));
        assert!(supervisor.calls().is_empty());
    }

    #[tokio::test]
    async fn blocked_clears_after_fix() {
        let (reconciler, _, _) = setup();
        let mut snapshot = base_snapshot();
        snapshot.charm.backend = String::new();
        let blocked = reconciler.reconcile(Trigger::ConfigChanged, &snapshot).await;
        assert_eq!(blocked.phase, Phase::Blocked);

        let mut fixed = next_snapshot(&snapshot, &blocked);
        fixed.charm.backend = "http://mybackend.local:80".into();
        let t = reconciler.reconcile(Trigger::ConfigChanged, &fixed).await;
        assert_eq!(t.phase, Phase::Ready);
    }

    #[tokio::test]
    async fn partial_relation_waits_instead_of_blocking() {
        let (reconciler, supervisor, _) = setup();
        let mut snapshot = base_snapshot();
        snapshot.charm.backend = String::new();
        snapshot.peer_relation = Some(PeerRelation {
            service_hostname: Some("hello.example.com".into()),
            ..PeerRelation::default()
        });

        let t = reconciler.reconcile(Trigger::RelationChanged, &snapshot).await;

        assert_eq!(t.phase, Phase::Waiting);
        assert!(t.is_deferred());
        assert!(matches!(t.status, UnitStatus::Waiting(_)));
        assert!(supervisor.calls().is_empty());
    }

    #[tokio::test]
    async fn unreachable_supervisor_defers() {
        let (reconciler, supervisor, _) = setup();
        *supervisor.unavailable.lock().unwrap() = true;

        let t = reconciler.reconcile(Trigger::ConfigChanged, &base_snapshot()).await;

        assert_eq!(t.phase, Phase::Waiting);
        assert_eq!(t.retry_after, Some(Duration::from_secs(5)));
        assert_eq!(t.status, UnitStatus::Waiting(SUPERVISOR_NOT_READY.into()));
        assert!(!t.applied);
    }

    #[tokio::test]
    async fn failure_while_applying_defers_and_retries_wholesale() {
        let (reconciler, supervisor, _) = setup();
        *supervisor.fail_push.lock().unwrap() = true;
        let snapshot = base_snapshot();

        let t = reconciler.reconcile(Trigger::ConfigChanged, &snapshot).await;
        assert_eq!(t.phase, Phase::Waiting);
        assert_eq!(t.path.last(), Some(&Phase::Waiting));
        assert!(t.path.contains(&Phase::Applying));
        assert!(supervisor.plan.lock().unwrap().services.is_empty());

        *supervisor.fail_push.lock().unwrap() = false;
        let retry = reconciler
            .reconcile(Trigger::SupervisorReady, &next_snapshot(&snapshot, &t))
            .await;
        assert_eq!(retry.phase, Phase::Ready);
        assert!(retry.applied);
    }

    #[tokio::test]
    async fn ingress_failure_defers() {
        let (reconciler, supervisor, ingress) = setup();
        *ingress.fail.lock().unwrap() = true;

        let t = reconciler.reconcile(Trigger::ConfigChanged, &base_snapshot()).await;

        assert_eq!(t.phase, Phase::Waiting);
        assert!(t.status.message().starts_with("Waiting for ingress"));
        assert!(supervisor.calls().is_empty());
    }

    #[tokio::test]
    async fn actions_do_not_touch_the_workload() {
        let (reconciler, supervisor, _) = setup();
        let mut snapshot = base_snapshot();
        snapshot
            .stored
            .set_status(&UnitStatus::Blocked("Required config(s) empty: backend".into()));

        let t = reconciler
            .reconcile(Trigger::ActionInvoked(ActionName::ReportVisitsByIp), &snapshot)
            .await;

        assert_eq!(t.phase, Phase::Idle);
        assert_eq!(t.status, snapshot.stored.status());
        assert!(supervisor.calls().is_empty());
    }
}

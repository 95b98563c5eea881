use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiState};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::health::{
    Decision, GovernorEvent, HealthProber, ProcessControl, RestartGovernor, ShellProcessControl,
    TargetHealth,
};
use crate::notify::{AlertSink, CommandSink, Notifier, Severity, WebhookSink};
use crate::promote::{
    CommandGates, CommandMigrator, GitVcs, PromotionPipeline, RestartVerifier, ServiceVerifier,
    ThresholdEngine,
};
use crate::scheduler::{Assigner, Task};
use crate::state::{EngineSnapshot, StateStore};

/// Priority given to escalation tasks so they outrank ordinary work.
const ESCALATION_PRIORITY: i64 = 1000;

/// Wires the assigner, governor, promotion engine, and API together.
pub struct Engine {
    config: EngineConfig,
    assigner: Arc<RwLock<Assigner>>,
    governor: Arc<RwLock<RestartGovernor>>,
    prober: HealthProber,
    verifier: Arc<dyn ServiceVerifier>,
    notifier: Arc<Notifier>,
    promotions: Arc<ThresholdEngine>,
    store: StateStore,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let process: Arc<dyn ProcessControl> = Arc::new(ShellProcessControl);

        let mut sinks: Vec<Arc<dyn AlertSink>> = Vec::new();
        if let Some(url) = &config.webhook_url {
            sinks.push(Arc::new(WebhookSink::new(url.clone())));
        }
        if let Some(command) = &config.notify_command {
            sinks.push(Arc::new(CommandSink::new(command.clone())));
        }
        let notifier = Arc::new(Notifier::new(sinks, config.alert_history));

        let assigner = Arc::new(RwLock::new(Assigner::new(
            config.retry.clone(),
            config.heartbeat_grace_ms,
            config.visibility_timeout_secs,
        )));

        let mut governor = RestartGovernor::new(config.restart.clone());
        for target in &config.targets {
            governor.track(&target.name, target.auto_restart);
        }
        let governor = Arc::new(RwLock::new(governor));

        let verifier: Arc<dyn ServiceVerifier> = Arc::new(RestartVerifier::new(
            process,
            &config.probe,
            config.restart.clone(),
        ));
        let vcs = Arc::new(GitVcs);
        let pipeline = PromotionPipeline::new(
            vcs.clone(),
            Arc::new(CommandGates),
            Arc::new(CommandMigrator),
            verifier.clone(),
        );
        let promotions = Arc::new(ThresholdEngine::new(
            config.clone(),
            vcs,
            pipeline,
            governor.clone(),
            notifier.clone(),
        ));

        let store = StateStore::new(config.state_file.clone());

        Self {
            prober: HealthProber::new(&config.probe),
            config,
            assigner,
            governor,
            verifier,
            notifier,
            promotions,
            store,
        }
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            assigner: self.assigner.clone(),
            governor: self.governor.clone(),
            promotions: self.promotions.clone(),
            notifier: self.notifier.clone(),
        }
    }

    /// Restore persisted state if a snapshot exists.
    pub async fn load_state(&self) -> Result<()> {
        let Some(snapshot) = self.store.load()? else {
            return Ok(());
        };
        tracing::info!(
            tasks = snapshot.tasks.len(),
            sessions = snapshot.sessions.len(),
            "Restoring engine state from snapshot"
        );
        {
            let mut assigner = self.assigner.write().await;
            assigner.queue.restore(snapshot.tasks);
            assigner.registry.restore(snapshot.sessions);
        }
        self.governor.write().await.restore(snapshot.targets);
        self.promotions
            .restore(snapshot.counters, snapshot.promotions)
            .await;
        self.notifier.restore(snapshot.alerts).await;
        Ok(())
    }

    pub async fn snapshot(&self) -> EngineSnapshot {
        let (tasks, sessions) = {
            let assigner = self.assigner.read().await;
            (
                assigner.queue.all().into_iter().cloned().collect(),
                assigner.registry.all().into_iter().cloned().collect(),
            )
        };
        EngineSnapshot {
            saved_at: Some(Utc::now()),
            tasks,
            sessions,
            targets: self.governor.read().await.states().clone(),
            counters: self.promotions.counters().await,
            promotions: self.promotions.history().await,
            alerts: self.notifier.recent().await,
        }
    }

    pub async fn persist(&self) -> Result<()> {
        let snapshot = self.snapshot().await;
        self.store.save(&snapshot)
    }

    /// Run every subsystem until the shutdown token fires:
    /// 1. Assignment loop: matches pending tasks to idle sessions, reaps
    ///    lapsed sessions and stalled tasks
    /// 2. Probe loop: checks each target and acts on governor decisions
    /// 3. Promotion loop: evaluates edge thresholds
    /// 4. Persistence loop: periodic snapshots
    /// 5. HTTP API (blocks until shutdown)
    ///
    /// A final snapshot is written on the way out.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.load_state().await?;

        let assigner = self.assigner.clone();
        let assign_notifier = self.notifier.clone();
        let assign_interval = self.config.assign_interval_ms;
        let assign_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(assign_interval));
            loop {
                tokio::select! {
                    _ = assign_shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let now = Utc::now();
                        let report = {
                            let mut assigner = assigner.write().await;
                            while assigner.assign_next(now).is_some() {}
                            assigner.reap(now)
                        };
                        for task_id in report.dead_lettered {
                            assign_notifier
                                .notify(
                                    Severity::Critical,
                                    "scheduler",
                                    format!("task {task_id} exhausted retries and was dead-lettered"),
                                )
                                .await;
                        }
                    }
                }
            }
        });

        let probe_engine = self.probe_handles();
        let probe_interval = self.config.probe.interval_secs;
        let probe_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(probe_interval.max(1)));
            loop {
                tokio::select! {
                    _ = probe_shutdown.cancelled() => break,
                    _ = interval.tick() => probe_engine.probe_cycle().await,
                }
            }
        });

        let promotions = self.promotions.clone();
        let promote_interval = self.config.promotion_interval_secs;
        let promote_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(promote_interval.max(1)));
            loop {
                tokio::select! {
                    _ = promote_shutdown.cancelled() => break,
                    _ = interval.tick() => promotions.tick(Utc::now()).await,
                }
            }
        });

        let api_state = self.api_state();
        let listen_addr = self.config.listen_addr;
        let api_shutdown = shutdown.clone();
        let api_task = tokio::spawn(async move {
            api::serve(listen_addr, api_state, api_shutdown).await;
        });

        let mut persist_interval =
            tokio::time::interval(Duration::from_secs(self.config.persist_interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = persist_interval.tick() => {
                    if let Err(e) = self.persist().await {
                        tracing::warn!(error = %e, "Snapshot write failed");
                    }
                }
            }
        }

        let _ = api_task.await;
        self.persist().await?;
        tracing::info!("Engine stopped");
        Ok(())
    }

    fn probe_handles(&self) -> ProbeDriver {
        ProbeDriver {
            config: self.config.clone(),
            assigner: self.assigner.clone(),
            governor: self.governor.clone(),
            prober: self.prober.clone(),
            verifier: self.verifier.clone(),
            notifier: self.notifier.clone(),
        }
    }

    /// One probe pass over every target, acting on any decisions. Used by
    /// the probe loop and by `overseer check`. Returns whether every
    /// tracked target came out healthy.
    pub async fn check_once(&self) -> bool {
        self.probe_handles().probe_cycle().await;
        let governor = self.governor.read().await;
        governor
            .states()
            .values()
            .all(|t| t.health == TargetHealth::Healthy)
    }
}

/// The probe loop's working set, detached from the engine so the loop owns
/// its handles.
struct ProbeDriver {
    config: EngineConfig,
    assigner: Arc<RwLock<Assigner>>,
    governor: Arc<RwLock<RestartGovernor>>,
    prober: HealthProber,
    verifier: Arc<dyn ServiceVerifier>,
    notifier: Arc<Notifier>,
}

impl ProbeDriver {
    async fn probe_cycle(&self) {
        for target in &self.config.targets {
            let result = self.prober.probe(target).await;
            tracing::debug!(
                target_name = %target.name,
                success = result.success,
                latency_ms = result.latency_ms,
                detail = %result.detail,
                "Probe finished"
            );

            let assessment = self
                .governor
                .write()
                .await
                .record_probe(&target.name, result.success, Utc::now());
            self.dispatch_events(&target.name, &assessment.events).await;

            if assessment.decision == Decision::Restart {
                self.notifier
                    .notify(
                        Severity::Warning,
                        &target.name,
                        format!("restarting after repeated probe failures ({})", result.detail),
                    )
                    .await;
                let outcome = self.verifier.restart_and_verify(target).await;
                let ok = outcome.is_ok();
                if let Err(e) = outcome {
                    tracing::warn!(target_name = %target.name, error = %e, "Restart verification failed");
                }
                let follow_up = self
                    .governor
                    .write()
                    .await
                    .record_restart_outcome(&target.name, ok, Utc::now());
                self.dispatch_events(&target.name, &follow_up.events).await;
            }
        }
    }

    async fn dispatch_events(&self, target: &str, events: &[GovernorEvent]) {
        for event in events {
            match event {
                GovernorEvent::Warned { failures } => {
                    self.notifier
                        .notify(
                            Severity::Warning,
                            target,
                            format!("{failures} consecutive probe failures"),
                        )
                        .await;
                }
                GovernorEvent::Recovered => {
                    self.notifier
                        .notify(Severity::Recovered, target, "target is healthy again")
                        .await;
                }
                GovernorEvent::CircuitOpened => {
                    self.notifier
                        .notify(
                            Severity::Critical,
                            target,
                            "restart budget exhausted, automatic restarts suspended",
                        )
                        .await;
                    self.submit_escalation(target).await;
                }
                GovernorEvent::CircuitClosed => {
                    self.notifier
                        .notify(Severity::Info, target, "circuit closed after cooldown")
                        .await;
                }
            }
        }
    }

    /// Circuit-open targets need a human; queue it as top-priority work
    /// that only sessions advertising the escalation capability can claim.
    async fn submit_escalation(&self, target: &str) {
        let task = Task::new(
            format!("investigate {target}: restarts suspended by circuit breaker"),
            ESCALATION_PRIORITY,
            0,
        )
        .with_caps(["escalation".to_string()]);
        let mut assigner = self.assigner.write().await;
        match assigner.submit(task) {
            Ok(id) => tracing::info!(target_name = %target, task_id = %id, "Escalation task submitted"),
            Err(e) => tracing::error!(target_name = %target, error = %e, "Escalation task rejected"),
        }
    }
}

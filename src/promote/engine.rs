use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::config::EngineConfig;
use crate::error::{OverseerError, Result};
use crate::health::{RestartGovernor, TargetHealth};
use crate::notify::{Notifier, Severity};
use crate::promote::counter::{
    PromotionEvent, PromotionStatus, Stage, ThresholdCounter, Trigger,
};
use crate::promote::pipeline::PromotionPipeline;
use crate::promote::vcs::Vcs;

#[derive(Debug, Default)]
struct PromoteState {
    counters: HashMap<String, ThresholdCounter>,
    history: Vec<PromotionEvent>,
    /// Edge -> the hold reason already recorded, so a held edge does not
    /// append an event and alert on every tick.
    held: HashMap<String, String>,
}

impl PromoteState {
    fn push(&mut self, event: PromotionEvent, limit: usize) {
        self.history.push(event);
        if self.history.len() > limit {
            let excess = self.history.len() - limit;
            self.history.drain(..excess);
        }
    }
}

/// Watches every configured edge and promotes when a threshold trips.
///
/// Each edge carries its own async mutex; a promotion holds it for the
/// whole pipeline, so a second trigger for the same edge (timer or manual)
/// waits out or skips the one in flight. Counters are re-derived from
/// version control each evaluation, so an evaluation that assigns no work
/// can run any number of times without side effects.
pub struct ThresholdEngine {
    config: EngineConfig,
    vcs: Arc<dyn Vcs>,
    pipeline: PromotionPipeline,
    governor: Arc<RwLock<RestartGovernor>>,
    notifier: Arc<Notifier>,
    state: RwLock<PromoteState>,
    locks: HashMap<String, Arc<Mutex<()>>>,
}

impl ThresholdEngine {
    pub fn new(
        config: EngineConfig,
        vcs: Arc<dyn Vcs>,
        pipeline: PromotionPipeline,
        governor: Arc<RwLock<RestartGovernor>>,
        notifier: Arc<Notifier>,
    ) -> Self {
        let locks = config
            .edges
            .iter()
            .map(|e| (e.name.clone(), Arc::new(Mutex::new(()))))
            .collect();
        Self {
            config,
            vcs,
            pipeline,
            governor,
            notifier,
            state: RwLock::new(PromoteState::default()),
            locks,
        }
    }

    pub async fn counters(&self) -> HashMap<String, ThresholdCounter> {
        self.state.read().await.counters.clone()
    }

    pub async fn history(&self) -> Vec<PromotionEvent> {
        self.state.read().await.history.clone()
    }

    pub async fn restore(
        &self,
        counters: HashMap<String, ThresholdCounter>,
        history: Vec<PromotionEvent>,
    ) {
        let mut state = self.state.write().await;
        state.counters = counters;
        state.history = history;
        // An attempt interrupted mid-flight stays in history as failed.
        for event in &mut state.history {
            if event.status == PromotionStatus::InProgress {
                event.finish(PromotionStatus::Failed, Utc::now());
            }
        }
        let limit = self.config.promotion_history;
        if state.history.len() > limit {
            let excess = state.history.len() - limit;
            state.history.drain(..excess);
        }
    }

    /// Refresh one edge's counters and report which threshold, if any,
    /// has tripped. The first evaluation of an edge only records the
    /// current head as baseline; promotion pressure builds from there.
    pub async fn evaluate(&self, edge_name: &str, now: DateTime<Utc>) -> Result<Option<Trigger>> {
        let edge = self
            .config
            .edge(edge_name)
            .ok_or_else(|| OverseerError::EdgeNotFound(edge_name.to_string()))?;

        let baseline = {
            let state = self.state.read().await;
            state.counters.get(edge_name).and_then(|c| c.baseline.clone())
        };

        let Some(baseline) = baseline else {
            let head = self.vcs.source_head(edge).await?;
            let mut state = self.state.write().await;
            let counter = state.counters.entry(edge_name.to_string()).or_default();
            counter.baseline = Some(head);
            counter.last_evaluated = Some(now);
            return Ok(None);
        };

        let (commits, features) = self.vcs.count_since(edge, Some(&baseline)).await?;
        let mut state = self.state.write().await;
        let counter = state.counters.entry(edge_name.to_string()).or_default();
        counter.observe(commits, features, now);

        if edge.commit_threshold > 0 && commits >= edge.commit_threshold {
            Ok(Some(Trigger::Commits))
        } else if edge.feature_threshold > 0 && features >= edge.feature_threshold {
            Ok(Some(Trigger::Features))
        } else {
            Ok(None)
        }
    }

    /// One evaluation pass over every edge.
    pub async fn tick(&self, now: DateTime<Utc>) {
        let edges: Vec<String> = self.config.edges.iter().map(|e| e.name.clone()).collect();
        for edge_name in edges {
            match self.evaluate(&edge_name, now).await {
                Ok(Some(trigger)) => {
                    if let Err(e) = self.promote(&edge_name, trigger).await {
                        if !matches!(e, OverseerError::PromotionInFlight(_)) {
                            tracing::error!(edge = %edge_name, error = %e, "Promotion attempt errored");
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(edge = %edge_name, error = %e, "Edge evaluation failed");
                }
            }
        }
    }

    /// Run the full pipeline for one edge. `Trigger::Manual` bypasses the
    /// counters but not the gates.
    pub async fn promote(&self, edge_name: &str, trigger: Trigger) -> Result<PromotionEvent> {
        let edge = self
            .config
            .edge(edge_name)
            .ok_or_else(|| OverseerError::EdgeNotFound(edge_name.to_string()))?
            .clone();
        let lock = self
            .locks
            .get(edge_name)
            .ok_or_else(|| OverseerError::EdgeNotFound(edge_name.to_string()))?
            .clone();
        let _guard = lock
            .try_lock()
            .map_err(|_| OverseerError::PromotionInFlight(edge_name.to_string()))?;

        if let Some(required) = &edge.requires_healthy {
            let health = self.governor.read().await.health_of(required);
            if health != Some(TargetHealth::Healthy) {
                let detail = format!(
                    "required target {required} is {}",
                    health.map(|h| h.to_string()).unwrap_or_else(|| "untracked".into())
                );
                return Ok(self.hold(edge_name, trigger, detail).await);
            }
        }

        if let Some(required) = &edge.requires_success_of {
            let upstream_ok = self
                .state
                .read()
                .await
                .history
                .iter()
                .rev()
                .find(|e| &e.edge == required)
                .map_or(true, |e| e.status == PromotionStatus::Succeeded);
            if !upstream_ok {
                let detail = format!("last promotion of edge {required} did not succeed");
                return Ok(self.hold(edge_name, trigger, detail).await);
            }
        }

        self.state.write().await.held.remove(edge_name);

        // Captured before the merge so the next counting window starts
        // exactly where this promotion ends.
        let promoted_head = self.vcs.source_head(&edge).await?;
        let service = edge
            .service
            .as_deref()
            .and_then(|name| self.config.target(name))
            .cloned();

        let event = self.pipeline.run(&edge, trigger, service.as_ref()).await;

        let mut state = self.state.write().await;
        match event.status {
            PromotionStatus::Succeeded => {
                state
                    .counters
                    .entry(edge_name.to_string())
                    .or_default()
                    .advance(promoted_head);
                self.notifier
                    .notify(
                        Severity::Info,
                        edge_name,
                        format!(
                            "promotion succeeded ({}), tagged {}",
                            trigger,
                            event.tag.as_deref().unwrap_or("-")
                        ),
                    )
                    .await;
            }
            PromotionStatus::RolledBack => {
                self.notifier
                    .notify(
                        Severity::Critical,
                        edge_name,
                        "promotion rolled back; environment restored",
                    )
                    .await;
            }
            _ => {
                self.notifier
                    .notify(Severity::Warning, edge_name, "promotion failed before merge")
                    .await;
            }
        }
        let limit = self.config.promotion_history;
        state.push(event.clone(), limit);
        Ok(event)
    }

    /// Records a held promotion without touching the pipeline or counters.
    /// An unchanged hold reason is logged but appends no event and fires
    /// no alert, so a tripped edge stuck behind a gate stays quiet.
    async fn hold(&self, edge_name: &str, trigger: Trigger, detail: String) -> PromotionEvent {
        let mut event = PromotionEvent::begin(edge_name, trigger, Utc::now());
        event.record(Stage::Gates, false, Some(detail.clone()));
        event.finish(PromotionStatus::Failed, Utc::now());

        {
            let mut state = self.state.write().await;
            if state.held.get(edge_name) == Some(&detail) {
                tracing::debug!(edge = %edge_name, reason = %detail, "Promotion still held");
                return event;
            }
            state.held.insert(edge_name.to_string(), detail.clone());
            state.push(event.clone(), self.config.promotion_history);
        }
        self.notifier
            .notify(
                Severity::Warning,
                edge_name,
                format!("promotion held: {detail}"),
            )
            .await;
        event
    }
}

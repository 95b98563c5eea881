use std::sync::Arc;

use chrono::Utc;

use crate::config::{EdgeConfig, TargetConfig};
use crate::promote::counter::{PromotionEvent, PromotionStatus, Stage, Trigger};
use crate::promote::ops::{GateRunner, MigrationRunner, ServiceVerifier};
use crate::promote::vcs::{next_tag, Vcs};

/// Executes one promotion end to end.
///
/// Stage order: merge, tag, gates, backup, migrate, restart, verify.
/// Gates run against the merged tree, so any failure after the merge
/// restores the backup and drops the merge before reporting `RolledBack`;
/// a failed merge itself reports `Failed` with nothing to undo. The
/// returned event records every stage either way.
pub struct PromotionPipeline {
    vcs: Arc<dyn Vcs>,
    gates: Arc<dyn GateRunner>,
    migrator: Arc<dyn MigrationRunner>,
    verifier: Arc<dyn ServiceVerifier>,
}

impl PromotionPipeline {
    pub fn new(
        vcs: Arc<dyn Vcs>,
        gates: Arc<dyn GateRunner>,
        migrator: Arc<dyn MigrationRunner>,
        verifier: Arc<dyn ServiceVerifier>,
    ) -> Self {
        Self {
            vcs,
            gates,
            migrator,
            verifier,
        }
    }

    pub async fn run(
        &self,
        edge: &EdgeConfig,
        trigger: Trigger,
        service: Option<&TargetConfig>,
    ) -> PromotionEvent {
        let mut event = PromotionEvent::begin(&edge.name, trigger, Utc::now());
        tracing::info!(edge = %edge.name, trigger = %trigger, "Promotion started");

        let rollback_ref = match self.vcs.target_head(edge).await {
            Ok(r) => r,
            Err(e) => {
                event.record(Stage::Merge, false, Some(e.to_string()));
                event.finish(PromotionStatus::Failed, Utc::now());
                return event;
            }
        };

        let merged = match self.vcs.merge(edge).await {
            Ok(r) => r,
            Err(e) => {
                event.record(Stage::Merge, false, Some(e.to_string()));
                // clear any half-finished merge state
                let _ = self.vcs.revert_to(edge, &rollback_ref).await;
                event.finish(PromotionStatus::Failed, Utc::now());
                tracing::warn!(edge = %edge.name, error = %e, "Merge failed");
                return event;
            }
        };
        event.merged_ref = Some(merged.clone());
        event.record(Stage::Merge, true, Some(merged.clone()));

        let latest = self.vcs.latest_tag(edge).await.ok().flatten();
        let tag = next_tag(&edge.tag_prefix, latest.as_deref());
        if let Err(e) = self.vcs.tag(edge, &tag).await {
            event.record(Stage::Tag, false, Some(e.to_string()));
            self.roll_back(edge, &rollback_ref, None, None, &mut event).await;
            return event;
        }
        event.tag = Some(tag.clone());
        event.record(Stage::Tag, true, Some(tag));

        // Gates validate the merged tree, not the pre-merge source.
        if let Err(e) = self.gates.run_gates(edge).await {
            event.record(Stage::Gates, false, Some(e.to_string()));
            tracing::warn!(edge = %edge.name, error = %e, "Promotion gates failed");
            self.roll_back(edge, &rollback_ref, None, None, &mut event).await;
            return event;
        }
        event.record(Stage::Gates, true, None);

        let backup = match self.migrator.backup(edge).await {
            Ok(handle) => {
                event.record(Stage::Backup, true, handle.clone());
                handle
            }
            Err(e) => {
                event.record(Stage::Backup, false, Some(e.to_string()));
                self.roll_back(edge, &rollback_ref, None, None, &mut event).await;
                return event;
            }
        };

        if let Err(e) = self.migrator.apply(edge).await {
            event.record(Stage::Migrate, false, Some(e.to_string()));
            self.roll_back(edge, &rollback_ref, backup.as_deref(), None, &mut event)
                .await;
            return event;
        }
        event.record(Stage::Migrate, true, None);

        if let Some(target) = service {
            match self.verifier.restart_and_verify(target).await {
                Ok(()) => {
                    event.record(Stage::Restart, true, None);
                    event.record(Stage::Verify, true, None);
                }
                Err(e) => {
                    event.record(Stage::Verify, false, Some(e.to_string()));
                    self.roll_back(edge, &rollback_ref, backup.as_deref(), service, &mut event)
                        .await;
                    return event;
                }
            }
        }

        event.finish(PromotionStatus::Succeeded, Utc::now());
        tracing::info!(
            edge = %edge.name,
            tag = event.tag.as_deref().unwrap_or("-"),
            "Promotion succeeded"
        );
        event
    }

    /// Undo in reverse order: data first, then the merge, then bounce the
    /// service back onto the old code when it was already restarted. Each
    /// step is attempted even if an earlier one fails, and each gets its
    /// own stage record.
    async fn roll_back(
        &self,
        edge: &EdgeConfig,
        rollback_ref: &str,
        backup: Option<&str>,
        service: Option<&TargetConfig>,
        event: &mut PromotionEvent,
    ) {
        tracing::warn!(edge = %edge.name, rollback_ref, "Rolling promotion back");
        let mut clean = true;

        if let Some(handle) = backup {
            if let Err(e) = self.migrator.restore(edge, handle).await {
                clean = false;
                tracing::error!(edge = %edge.name, error = %e, "Backup restore failed");
                event.record(Stage::Rollback, false, Some(format!("restore: {e}")));
            }
        }

        if let Err(e) = self.vcs.revert_to(edge, rollback_ref).await {
            clean = false;
            tracing::error!(edge = %edge.name, error = %e, "Merge revert failed");
            event.record(Stage::Rollback, false, Some(format!("revert: {e}")));
        }

        if let Some(target) = service {
            if let Err(e) = self.verifier.restart_and_verify(target).await {
                clean = false;
                tracing::error!(edge = %edge.name, error = %e, "Post-rollback restart failed");
                event.record(Stage::Rollback, false, Some(format!("restart: {e}")));
            }
        }

        if clean {
            event.record(Stage::Rollback, true, None);
        }
        event.finish(PromotionStatus::RolledBack, Utc::now());
    }
}

pub mod counter;
pub mod engine;
pub mod ops;
pub mod pipeline;
pub mod vcs;

pub use counter::{PromotionEvent, PromotionStatus, Stage, ThresholdCounter, Trigger};
pub use engine::ThresholdEngine;
pub use ops::{CommandGates, CommandMigrator, GateRunner, MigrationRunner, RestartVerifier, ServiceVerifier};
pub use pipeline::PromotionPipeline;
pub use vcs::{GitVcs, Vcs};

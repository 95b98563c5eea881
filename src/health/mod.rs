pub mod governor;
pub mod prober;
pub mod process;
pub mod window;

pub use governor::{Decision, GovernorEvent, RestartGovernor, TargetHealth};
pub use prober::{HealthProber, ProbeResult};
pub use process::{ProcessControl, ShellProcessControl};
pub use window::FailureWindow;

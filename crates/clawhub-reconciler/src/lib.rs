pub mod audit;
pub mod desired;
pub mod drift;
pub mod engine;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod preprocess;
pub mod report;
pub mod scheduler;


pub use audit::{AuditFinding, AuditVerdict, PolicyAudit, SecurityAudit};
pub use drift::DriftDetector;
pub use engine::Reconciler;
pub use error::ReconcileError;
pub use events::{BroadcastEvents, LogSource, ProvisioningEvent, ProvisioningEvents, StepState};
pub use lifecycle::LifecycleManager;
pub use preprocess::{
    ensure_delegation_api_key, rotate_delegation_api_key, DelegationInjector, PreprocessContext,
    Preprocessor, PreprocessorChain, VaultSkillInjector, DELEGATION_KEY_LABEL,
};
pub use report::{DriftReport, LifecycleStatus, ReconcileResult, UpdateOutcome};
pub use scheduler::{Scheduler, SchedulerConfig};

// Runtime layer: receives declarations, reconciles workers against the
// resolved component set, and owns the cross-cutting services (vault,
// declaration store, tracers).

mod agent;
mod reconcile;
mod storage;
mod tracer;
mod vault;
mod worker;

pub use agent::{Agent, ConsumerFactory};
pub use reconcile::{ReconcilePlan, diff};
pub use storage::DeclarationStore;
pub use tracer::FileTracer;
pub use vault::LocalVault;
pub use worker::{ConfigEvent, ConfigWorker, ProcessOptions};

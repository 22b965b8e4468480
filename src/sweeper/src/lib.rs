pub mod chainquery;
pub mod error;
pub mod inventory;
pub mod metrics;
pub mod pipeline;
pub mod pool;
pub mod purge;
pub mod reader;
pub mod reflector;
pub mod resolver;
pub mod state;
pub mod verifier;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use chainquery::{ChainqueryDb, ClaimIndex, ClaimRow};
pub use error::{SweepError, SweepResult};
pub use metrics::{RunMetrics, RunSummary};
pub use pipeline::{SweepClients, SweepPlan, SweepReport, Sweeper};
pub use purge::{BulkDeleter, ObjectStoreDeleter, PurgeOutcome};
pub use reflector::{ReflectorDb, StreamSource};
pub use resolver::ClaimChecks;
pub use state::LocalStateStore;
pub use verifier::{ClaimLookup, HubClient};

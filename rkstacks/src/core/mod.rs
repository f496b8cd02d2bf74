//! The reconciliation core.
//!
//! Everything in this module is a pure function of the observed state
//! assembled into a [`StackSetContainer`]: no I/O, no clock reads. The
//! controller samples the clock once per reconciliation and passes it
//! down, which keeps the engine deterministic and testable.

use common::IntOrString;
use thiserror::Error;

pub mod autoscaler;
pub mod lifecycle;
pub mod resources;
pub mod traffic;
pub mod types;

pub use types::{StackContainer, StackSetContainer};

/// API group/version stamped on StackSet and Stack objects.
pub const API_VERSION: &str = "zalando.org/v1";

/// Heritage label pointing at the owning stackset. Together with
/// [`STACK_VERSION_LABEL_KEY`] these are the only labels ever used in
/// deployment and service selectors.
pub const STACKSET_HERITAGE_LABEL_KEY: &str = "stackset";
pub const STACK_VERSION_LABEL_KEY: &str = "stack-version";

/// Annotation on generated resources carrying the stack generation,
/// used as a cheap "did the spec change?" check by the writer.
pub const STACK_GENERATION_ANNOTATION_KEY: &str =
    "stackset-controller.zalando.org/stack-generation";

/// Shared-ingress annotation holding the weights actually serving
/// traffic, as a JSON object of `stackName: weight`.
pub const BACKEND_WEIGHTS_ANNOTATION_KEY: &str = "zalando.org/backend-weights";

/// Shared-ingress annotation holding the weights the user wants.
pub const STACK_TRAFFIC_WEIGHTS_ANNOTATION_KEY: &str = "zalando.org/stack-traffic-weights";

pub(crate) const DEFAULT_VERSION: &str = "01";
pub(crate) const DEFAULT_STACK_LIFECYCLE_LIMIT: usize = 10;
pub(crate) const DEFAULT_SCALEDOWN_TTL_SECONDS: i64 = 300;

/// Errors raised by the reconciliation core. All of them are non-fatal
/// to the controller: the affected resource is skipped for the current
/// tick and retried on the next one.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The shared ingress would have no backend with positive actual
    /// weight.
    #[error("invalid ingress, no paths defined")]
    NoPaths,

    /// Desired weights sum to zero and no fallback stack exists.
    #[error("no stacks to assign traffic to")]
    NoStacksForTraffic,

    /// The ingress backend port matches none of the service ports.
    #[error("no service ports matching backendPort '{0}'")]
    PortMismatch(IntOrString),

    /// An autoscaler custom metric cannot be translated into the
    /// native metric shape.
    #[error("invalid custom metric: {0}")]
    CustomMetricTranslation(String),
}

//! Kernel module state on cluster nodes
//!
//! Node and module state is always derived from live inspection and thrown
//! away after one cycle; the cluster itself is the only durable state.
//!
//! - [`state`]: `ModuleState` and the probe output parser
//! - [`probe`]: inspection of a single node
//! - [`aggregate`]: cluster-wide view built with a bounded probe pool
//! - [`unload`]: ordered teardown of the NFS stack on a node

pub mod aggregate;
pub mod probe;
pub mod state;
pub mod unload;

pub use aggregate::{ClusterModuleState, ClusterStateAggregator, NodeModuleState, ProbeFailure};
pub use probe::{probe_node, probe_node_lenient, ProbeError};
pub use state::{parse_probe_output, ModuleState, ParseError, PROBE_SCRIPT};
pub use unload::{
    batch_script, parse_batch_output, unload_plan, GracefulUnloadSequencer, StepFailure,
    UnloadReport, UnloadStep, STEP_MARKER,
};

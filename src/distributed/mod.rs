//! Multi-rank execution.
//!
//! Tile rows are split across nodes and then across each node's devices with the
//! shared partition rule ([`plan`]). Each rank matches its own rows, reports its row
//! count to the root, and after the root's release sends its slice; the root places
//! every slice by the offset its position in the plan implies ([`coordinator`]).
//! [`comm`] carries the messages between threads of one process; with the `tcp`
//! feature, `tcp` carries them between processes.

pub mod comm;
pub mod coordinator;
pub mod plan;
#[cfg(feature = "tcp")]
pub mod tcp;

pub use comm::{Communicator, Endpoint, Link, LocalCluster, LocalComm, Message, ROOT};
pub use coordinator::{Coordinator, run_local_cluster};
pub use plan::{DeviceAssignment, DeviceKind, PartitionPlan, Topology};
#[cfg(feature = "tcp")]
pub use tcp::{TcpComm, TcpLink};

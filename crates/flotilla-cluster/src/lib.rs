//! flotilla-cluster: the controller's view of the cluster.
//!
//! [`ClusterView`] and [`HostJobClient`] are the seams between the
//! controller and the hosts that actually run jobs. [`remote::HttpCluster`]
//! reaches host agents over HTTP; [`memory::MemoryCluster`] is an
//! in-process stand-in.

pub mod client;
pub mod error;
pub mod memory;
pub mod remote;

pub use client::{AttachHandle, AttachIo, ClusterView, HostJobClient, TerminalControl};
pub use error::{ClusterError, ClusterResult};
pub use remote::{ATTACH_PROTOCOL, HttpCluster, HttpHostClient};
pub use memory::{MemoryCluster, MemoryHost};

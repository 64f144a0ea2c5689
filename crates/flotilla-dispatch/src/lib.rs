//! flotilla-dispatch: running jobs on the cluster.
//!
//! [`JobDispatcher`] resolves a release into a container spec, picks a
//! host, submits the job, and optionally attaches to it. It also lists,
//! stops, and reads the output of jobs across every host.

pub mod dispatcher;
pub mod error;
pub mod placement;

pub use dispatcher::{JobDispatcher, container_config, merge_env};
pub use error::{DispatchError, DispatchResult};
pub use placement::select_host;

/// Fragment splitting and reassembly
pub mod cluster;
#[allow(clippy::module_inception)]
pub mod session;

pub use cluster::{Cluster, FragmentTable, fragment};
pub(crate) use session::SessionParts;
pub use session::{Session, SessionStatus, State, jittered, new_job};

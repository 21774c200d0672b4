/// Error types and Result alias
pub mod error;
/// Queue sizes, timeouts and protocol bounds
pub mod limits;
pub mod device;
pub mod net;
pub mod tls;

pub use device::Device;
pub use error::*;
pub use net::*;
pub use tls::*;

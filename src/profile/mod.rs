/// Connection configuration
#[allow(clippy::module_inception)]
pub mod profile;
/// Connector hints
pub mod setting;

pub use profile::{Profile, ProfileBuilder};
pub use setting::Setting;

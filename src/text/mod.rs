/// Randomized pattern templates
pub mod matcher;

pub use matcher::*;

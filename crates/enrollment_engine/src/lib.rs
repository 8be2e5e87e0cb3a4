mod domain;
mod enrollment_engine;
pub mod mqtt;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use domain::*;
pub use enrollment_engine::*;

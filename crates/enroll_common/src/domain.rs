mod enrollment;
mod notification;
mod profile;
mod result;

pub use enrollment::*;
pub use notification::*;
pub use profile::*;
pub use result::*;

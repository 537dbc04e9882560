//! Data models shared by every Stowage crate.

mod backend_profile;
mod file;
mod job;
mod policy;

pub use backend_profile::*;
pub use file::*;
pub use job::*;
pub use policy::*;

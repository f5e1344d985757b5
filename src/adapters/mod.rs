//! Adapters to the processes the agent drives: the backup engine and
//! commands run inside target containers

mod chroot;
mod exec;
mod restic;

pub use chroot::*;
pub use exec::stream_command;
pub use restic::*;

//! Provisioners served by this plugin.

mod shell_local;

pub use shell_local::ShellLocalProvisioner;

//! Communicator implementations that ship with the core.

mod local;

pub use local::LocalCommunicator;

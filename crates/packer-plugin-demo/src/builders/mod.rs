//! Builders served by this plugin.

mod echo;
mod file;
mod null;

pub use echo::EchoBuilder;
pub use file::FileBuilder;
pub use null::NullBuilder;

use packer_core::{PluginError, Result, StateBag};

/// Turn the end state of a multistep run into the builder's result.
fn run_result(state: &mut StateBag) -> Result<()> {
    if let Some(e) = state.take_error() {
        return Err(e);
    }
    if state.is_cancelled() {
        return Err(PluginError::Cancelled);
    }
    Ok(())
}

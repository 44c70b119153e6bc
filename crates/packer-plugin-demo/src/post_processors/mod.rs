//! Post-processors served by this plugin.

mod checksum;

pub use checksum::ChecksumPostProcessor;

//! Stream multiplexing over the single core-to-plugin connection.
//!
//! Every RPC session, nested callback server and byte transfer between the
//! core and one plugin process runs on its own logical stream of one
//! [`MuxBroker`].

mod broker;
mod frame;
mod stream;

pub use broker::{BrokerRole, MuxBroker};
pub use stream::MuxStream;

// Command channel between the run client and the model server.
// Newline-delimited JSON over TCP, strictly one outstanding request per connection.

pub mod client;
pub mod dispatcher;
pub mod protocol;
pub mod server;
pub mod wire;

pub use client::{CommandChannel, MessageClient};
pub use dispatcher::{CommandDispatcher, DispatcherState, Flow};
pub use protocol::{Message, MsgEvent, MsgType};
pub use server::{BadRequest, MessageServer};

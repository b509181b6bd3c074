//! Streaming fabric: camera pipelines, meta-frame broadcaster, client
//! acceptor and the TCP wire types.

pub mod acceptor;
pub mod broadcaster;
pub mod camera;
pub mod wire;

pub use acceptor::Acceptor;
pub use broadcaster::{Broadcaster, BroadcasterHandle};
pub use camera::{CameraFeed, CameraState};
pub use wire::{Client, ClientList, STREAM_MAGIC};

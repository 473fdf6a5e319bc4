//! Local-first cache and sync engine for a channel-based video player.
//!
//! Channels, videos and watch history are served from SQLite; the network is
//! only consulted to fill gaps, and every committed write is pushed to live
//! queries as a fresh snapshot.

pub mod cache;
pub mod channels;
pub mod config;
pub mod constants;
pub mod cursor;
pub mod error;
pub mod history;
pub mod live;
pub mod model;
pub mod provider;
pub mod remote;
pub mod store;
pub mod sync;
pub mod videos;
pub mod youtube;

pub use cache::ChannelCache;
pub use error::{SyncError, SyncResult};
pub use model::{Channel, Cursor, HistoryRecord, Video};
pub use sync::{SyncContext, SyncEvent};

//! Channel forest, MPTT persistence and per-session selection.

pub mod selection;
pub mod tree;

pub use selection::{ChannelScope, ChannelSelection};
pub use tree::{Channel, ChannelNode, ChannelTree, ConsistencyReport};

//! MixCraft Core Types
//!
//! This crate defines the value types shared by every MixCraft component:
//! identifiers, channel state, probabilistic tickets, acknowledgements and
//! the fixed-size packet wire layout.

mod acknowledgement;
mod error;
mod onion;
mod packet;
mod ticket;
mod types;

pub use acknowledgement::*;
pub use error::*;
pub use onion::*;
pub use packet::*;
pub use ticket::*;
pub use types::*;

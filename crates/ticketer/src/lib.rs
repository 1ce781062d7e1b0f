#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod allocator;
pub mod claim;
mod error;
mod range;
mod store;

pub use crate::allocator::*;
pub use crate::claim::{Ticket, TicketBatch};
pub use crate::error::*;
pub use crate::range::*;
pub use crate::store::*;

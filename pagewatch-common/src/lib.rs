#![cfg_attr(not(test), no_std)]

mod event;
mod layout;
pub mod probe;

pub use event::*;
pub use layout::*;

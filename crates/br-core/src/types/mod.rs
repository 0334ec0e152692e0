//! Core data types, enums, and records exchanged between components.

pub mod enums;
pub mod event;
pub mod market_data;
pub mod trading;

pub use enums::*;
pub use event::*;
pub use market_data::*;
pub use trading::*;

//! Core data types, enums, quotes, and trading structures.

pub mod account;
pub mod enums;
pub mod market_data;
pub mod trading;

pub use account::*;
pub use enums::*;
pub use market_data::*;
pub use trading::*;

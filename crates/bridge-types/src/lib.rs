pub mod chat;
pub mod error;
pub mod wire;

pub use chat::*;
pub use error::*;
pub use wire::*;

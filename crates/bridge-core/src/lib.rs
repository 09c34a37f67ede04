pub mod bridge;
pub mod config;
pub mod request;
pub mod response;
pub mod session;

pub const DEFAULT_BRIDGE_HOST: &str = "127.0.0.1";
pub const DEFAULT_BRIDGE_PORT: u16 = 8080;

pub use bridge::*;
pub use config::*;
pub use request::*;
pub use response::*;
pub use session::*;

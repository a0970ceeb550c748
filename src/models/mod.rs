pub mod authorization;
pub mod connection;
pub mod routing;
pub mod tunnel;

pub use authorization::*;
pub use connection::*;
pub use routing::*;
pub use tunnel::*;

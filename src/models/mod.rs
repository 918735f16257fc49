pub mod proxy;
pub mod status;

pub use proxy::*;
pub use status::*;

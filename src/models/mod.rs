pub mod proxy;
pub mod snapshot;

pub use proxy::*;
pub use snapshot::*;

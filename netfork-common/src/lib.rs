pub mod handle;
pub mod nt;
pub mod proto;
pub mod tracing;
pub mod transport;

pub use anyhow;
pub use ntapi;
pub use winapi;

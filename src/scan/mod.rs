//! Building snapshots of both sides.

pub mod filter;
pub mod local;
pub mod remote;

pub use filter::PathFilter;
pub use local::LocalScanner;
pub use remote::RemoteScanner;

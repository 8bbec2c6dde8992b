//! The metron agent: configuration-driven runtime tying providers,
//! collectors and writers together.

pub mod functions;
pub mod runtime;

pub use runtime::Runtime;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

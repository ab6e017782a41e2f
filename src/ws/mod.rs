pub mod broadcaster;
pub mod connctx;
pub mod connection;
pub mod gate;
pub mod reaper;
pub mod registry;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use gate::ws_handler;
pub use registry::{RegistrySettings, SessionRegistry};

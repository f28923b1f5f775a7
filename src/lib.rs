pub mod config;
pub mod dispatch;
pub mod nanny;
pub mod net;
pub mod notify;
pub mod queue;
pub mod server;
pub mod store;
pub mod task;
pub mod types;
pub mod util;
pub mod wire;

#[cfg(test)]
mod testutil;

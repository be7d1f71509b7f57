// =============================================================================
// OKX exchange integration: signed REST gateway and the per-user client pool
// =============================================================================

pub mod client;
pub mod pool;
pub mod types;

pub use client::OkxClient;
pub use pool::{ClientPool, PooledClient};

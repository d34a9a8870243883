pub mod benchmark;
pub mod checkpoint;
pub mod config;
pub mod device;
pub mod distributed;
pub mod models;
pub mod seed;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use benchmark::{measure_throughput, Throughput};
pub use config::VitConfig;
pub use device::select_device;
pub use models::VisionTransformer;
pub use seed::seed_everything;

pub mod device;
pub mod dmsetup;
pub mod pool;

pub use device::{BlockDeviceManager, DeviceInfo};
pub use pool::{PoolHealth, PoolManager, PoolStatus};

//! # Tuyalan
//!
//! Local-area client for Tuya-compatible smart-home devices speaking the
//! LAN protocol (generations 3.1 through 3.5), with no cloud dependency.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tuyalan::DeviceBuilder;
//!
//! # async fn demo() -> tuyalan::Result<()> {
//! let device = DeviceBuilder::new("DEVICE_ID", "DEVICE_KEY")
//!     .address("192.168.1.40")
//!     .version("3.4")
//!     .build()?;
//!
//! let status = device.status().await?;
//! println!("dps: {}", status["dps"]);
//! device.set_value(1, true.into(), false).await?;
//! device.close().await;
//! # Ok(())
//! # }
//! ```
//!
pub mod crypto;
pub mod device;
pub mod error;
pub mod payload;
pub mod protocol;
pub mod scanner;

pub use device::{Device, DeviceBuilder};
pub use error::{Result, TuyaError};
pub use protocol::{CommandType, TuyaMessage, Version};
pub use scanner::{DeviceAnnouncement, Scanner};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[must_use]
pub fn version() -> &'static str {
    VERSION
}

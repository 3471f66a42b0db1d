pub mod address;
pub mod command;
pub mod error;
pub mod frame;
pub mod operation;
pub mod simulator;
pub mod transport;
pub mod value;

pub use address::DeviceAddress;
pub use error::HbusError;

pub mod config;
pub mod init;
pub mod replay;

pub use config::{config, ConfigArgs};
pub use init::{init, InitArgs};
pub use replay::{replay, ReplayArgs};

pub mod config;
pub mod config_file;
pub mod error;
pub mod launcher;
pub mod logger;
pub mod provision;
pub mod proxy;
pub mod supervisor;

pub use config::LauncherSettings;
pub use error::{LaunchError, Result};
pub use launcher::Launcher;
pub use provision::BinaryStatus;
pub use supervisor::ProcessStatus;

mod plan;
mod ports;
mod up;

pub use plan::run_plan;
pub use ports::run_ports;
pub use up::{run_up, UpOptions};

use std::path::{Path, PathBuf};

/// Directory holding the stack file; per-project state lives beneath it.
pub fn project_dir(config_path: &Path) -> anyhow::Result<PathBuf> {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => Ok(parent.to_path_buf()),
        _ => Ok(std::env::current_dir()?),
    }
}

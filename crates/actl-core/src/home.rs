//! Canonical home directory resolution for agent-ctl.
//!
//! Single source of truth for locating `${ACTL_HOME}` across all agent-ctl
//! crates. Supports custom deployments and testing via the `ACTL_HOME`
//! environment variable.
//!
//! # Precedence
//!
//! 1. `ACTL_HOME` environment variable (if set and non-empty)
//! 2. `dirs::home_dir()` platform default

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Get the home directory for agent-ctl operations.
///
/// # Errors
///
/// Returns an error if `ACTL_HOME` is unset and the platform home directory
/// cannot be determined.
pub fn get_home_dir() -> Result<PathBuf> {
    // ACTL_HOME first (useful for testing and custom deployments)
    if let Ok(home) = std::env::var("ACTL_HOME") {
        let trimmed = home.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }
    dirs::home_dir().context("Could not determine home directory")
}

/// Directory holding the receiver socket, PID file, and default roster.
pub fn control_dir() -> Result<PathBuf> {
    Ok(get_home_dir()?.join(".actl"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    #[test]
    #[serial]
    fn actl_home_overrides_platform_default() {
        let original = env::var("ACTL_HOME").ok();
        unsafe { env::set_var("ACTL_HOME", "/custom/home") };

        assert_eq!(get_home_dir().unwrap(), PathBuf::from("/custom/home"));
        assert_eq!(control_dir().unwrap(), PathBuf::from("/custom/home/.actl"));

        unsafe {
            match original {
                Some(v) => env::set_var("ACTL_HOME", v),
                None => env::remove_var("ACTL_HOME"),
            }
        }
    }

    #[test]
    #[serial]
    fn empty_actl_home_falls_back_to_platform_default() {
        let original = env::var("ACTL_HOME").ok();
        unsafe { env::set_var("ACTL_HOME", "  ") };

        assert_eq!(get_home_dir().unwrap(), dirs::home_dir().unwrap());

        unsafe {
            match original {
                Some(v) => env::set_var("ACTL_HOME", v),
                None => env::remove_var("ACTL_HOME"),
            }
        }
    }

    #[test]
    #[serial]
    fn whitespace_is_trimmed() {
        let original = env::var("ACTL_HOME").ok();
        unsafe { env::set_var("ACTL_HOME", "  /custom/home  ") };

        assert_eq!(get_home_dir().unwrap(), PathBuf::from("/custom/home"));

        unsafe {
            match original {
                Some(v) => env::set_var("ACTL_HOME", v),
                None => env::remove_var("ACTL_HOME"),
            }
        }
    }
}

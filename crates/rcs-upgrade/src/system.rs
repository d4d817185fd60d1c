//! ---
//! rcs_section: "02-upgrade-engine"
//! rcs_subsection: "module"
//! rcs_type: "source"
//! rcs_scope: "code"
//! rcs_description: "OTA upgrade orchestration for dual-bank devices."
//! rcs_version: "v0.0.0-prealpha"
//! rcs_owner: "tbd"
//! ---
//! Device primitives the engine needs from the host: block storage handling
//! and the bootloader environment, both expressed on top of a trusted command
//! executor.

use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, UpgradeError};

/// Runs a host program with arguments and returns its stdout.
///
/// Implementations are trusted to pass arguments without shell interpretation.
pub trait CommandExecutor: Send + Sync + Debug {
    fn execute(&self, program: &str, args: &[&str]) -> std::result::Result<String, String>;
}

/// [`CommandExecutor`] backed by `std::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellExecutor;

impl CommandExecutor for ShellExecutor {
    fn execute(&self, program: &str, args: &[&str]) -> std::result::Result<String, String> {
        debug!(program, ?args, "executing");
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| format!("failed to spawn {program}: {err}"))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "{program} exited with {}: {}",
                output.status,
                stderr.trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

pub trait BlockStorage: Send + Sync + Debug {
    /// Filesystem type currently on `device`, if any can be detected.
    fn filesystem_type(&self, device: &Path) -> Option<String>;
    fn format(&self, device: &Path, fs_type: &str) -> Result<()>;
    fn mount(&self, device: &Path, mount_point: &Path) -> Result<()>;
    fn unmount(&self, mount_point: &Path) -> Result<()>;
    /// Device backing the live `/` mount.
    fn root_device(&self) -> Result<PathBuf>;
}

/// Persistent key/value store the bootloader reads at boot.
pub trait BootEnv: Send + Sync + Debug {
    fn read_var(&self, name: &str) -> Result<Option<String>>;
    fn write_var(&self, name: &str, value: &str) -> Result<()>;
    fn clear_var(&self, name: &str) -> Result<()>;
}

/// Host tools (`blkid`, `mkfs`, `mount`, `fw_setenv`, ...) driven through an executor.
#[derive(Debug, Clone)]
pub struct DeviceTools {
    executor: Arc<dyn CommandExecutor>,
}

impl DeviceTools {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    fn run(&self, program: &str, args: &[&str]) -> std::result::Result<String, String> {
        self.executor.execute(program, args)
    }
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| UpgradeError::Partition(format!("non UTF-8 path {}", path.display())))
}

impl BlockStorage for DeviceTools {
    fn filesystem_type(&self, device: &Path) -> Option<String> {
        let device = path_arg(device).ok()?;
        let out = self
            .run("blkid", &["-o", "value", "-s", "TYPE", device])
            .ok()?;
        let fs_type = out.trim();
        if fs_type.is_empty() {
            None
        } else {
            Some(fs_type.to_owned())
        }
    }

    fn format(&self, device: &Path, fs_type: &str) -> Result<()> {
        let program = format!("mkfs.{fs_type}");
        self.run(&program, &["-F", path_arg(device)?])
            .map(|_| ())
            .map_err(|err| UpgradeError::Partition(format!("format {}: {err}", device.display())))
    }

    fn mount(&self, device: &Path, mount_point: &Path) -> Result<()> {
        self.run("mount", &[path_arg(device)?, path_arg(mount_point)?])
            .map(|_| ())
            .map_err(|err| UpgradeError::Partition(format!("mount {}: {err}", device.display())))
    }

    fn unmount(&self, mount_point: &Path) -> Result<()> {
        self.run("umount", &[path_arg(mount_point)?])
            .map(|_| ())
            .map_err(|err| {
                UpgradeError::Partition(format!("unmount {}: {err}", mount_point.display()))
            })
    }

    fn root_device(&self) -> Result<PathBuf> {
        let out = self
            .run("mountpoint", &["-n", "/"])
            .map_err(|err| UpgradeError::Partition(format!("resolve root device: {err}")))?;
        out.split_whitespace()
            .next()
            .map(PathBuf::from)
            .ok_or_else(|| UpgradeError::Partition("mountpoint printed no device".to_owned()))
    }
}

impl BootEnv for DeviceTools {
    fn read_var(&self, name: &str) -> Result<Option<String>> {
        // fw_printenv fails for unset variables.
        match self.run("fw_printenv", &["-n", name]) {
            Ok(value) => Ok(Some(value.trim().to_owned())),
            Err(err) => {
                debug!(name, error = %err, "bootloader variable unavailable");
                Ok(None)
            }
        }
    }

    fn write_var(&self, name: &str, value: &str) -> Result<()> {
        self.run("fw_setenv", &[name, value])
            .map(|_| ())
            .map_err(|err| UpgradeError::Partition(format!("fw_setenv {name}={value}: {err}")))
    }

    fn clear_var(&self, name: &str) -> Result<()> {
        self.run("fw_setenv", &[name])
            .map(|_| ())
            .map_err(|err| UpgradeError::Partition(format!("fw_setenv {name}: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct RecordingExecutor {
        calls: Mutex<Vec<String>>,
        reply: String,
    }

    impl CommandExecutor for RecordingExecutor {
        fn execute(&self, program: &str, args: &[&str]) -> std::result::Result<String, String> {
            let mut line = program.to_owned();
            for arg in args {
                line.push(' ');
                line.push_str(arg);
            }
            self.calls.lock().push(line);
            Ok(self.reply.clone())
        }
    }

    #[test]
    fn root_device_takes_first_field() {
        let executor = Arc::new(RecordingExecutor {
            reply: "/dev/mmcblk0p3 /\n".into(),
            ..Default::default()
        });
        let tools = DeviceTools::new(executor.clone());
        assert_eq!(
            tools.root_device().unwrap(),
            PathBuf::from("/dev/mmcblk0p3")
        );
        assert_eq!(executor.calls.lock().as_slice(), ["mountpoint -n /"]);
    }

    #[test]
    fn boot_env_commands() {
        let executor = Arc::new(RecordingExecutor::default());
        let tools = DeviceTools::new(executor.clone());
        tools.write_var("use_part_b", "1").unwrap();
        tools.clear_var("boot_rollback").unwrap();
        tools.format(Path::new("/dev/mmcblk0p5"), "ext4").unwrap();
        assert_eq!(
            executor.calls.lock().as_slice(),
            [
                "fw_setenv use_part_b 1",
                "fw_setenv boot_rollback",
                "mkfs.ext4 -F /dev/mmcblk0p5",
            ]
        );
    }

    #[test]
    fn empty_blkid_output_means_unformatted() {
        let tools = DeviceTools::new(Arc::new(RecordingExecutor::default()));
        assert_eq!(tools.filesystem_type(Path::new("/dev/mmcblk0p5")), None);
    }
}

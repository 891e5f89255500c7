//! Filesystem manager: owns the basic and devfs roots, the mount table, and
//! the path walk. Paths are absolute, `/`-separated, with no `.`/`..`
//! interpretation.

use alloc::borrow::ToOwned;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use conquer_once::spin::OnceCell;

use crate::error::{Error, Result};
use crate::kernel_log;
use crate::scheduler::mutex::Critical;

pub mod basicfs;
pub mod cache;
pub mod devfs;
pub mod tmpfs;
pub mod vfs;

use basicfs::BasicDriver;
use devfs::{DevDriver, Device};
use tmpfs::TmpDriver;
use vfs::{Driver, FileOperator, FileType, Handle, OPEN_RO, OPEN_RW, OpenMode, follow_overlay};

static FS: OnceCell<FsManager> = OnceCell::uninit();

struct MountRecord {
    source: String,
    mountpoint: String,
    /// Kept so mount-local drivers (tmpfs) live exactly as long as the mount.
    _driver: Arc<dyn Driver>,
    root: Arc<FileOperator>,
    /// Write handle pinning the mountpoint FOP for the mount's lifetime.
    pin: Handle,
}

pub struct FsManager {
    _basic: Arc<BasicDriver>,
    devfs: Arc<DevDriver>,
    root: Arc<FileOperator>,
    devfs_root: Arc<FileOperator>,
    mounts: Critical<Vec<MountRecord>>,
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

fn normalize_path(path: &str) -> String {
    let elms = split_path(path);
    if elms.is_empty() {
        return "/".to_owned();
    }
    let mut normalized = String::new();
    for elm in elms {
        normalized.push('/');
        normalized.push_str(elm);
    }
    normalized
}

impl FsManager {
    fn open_root(&self, mode: OpenMode) -> Result<Handle> {
        Handle::open_fop(follow_overlay(self.root.clone()), mode)
    }

    /// The open walk: descend read-only, open the leaf with the requested
    /// mode. Intermediate handles close as soon as their child is open.
    fn open(&self, path: &str, mode: OpenMode) -> Result<Handle> {
        let elms = split_path(path);
        let Some((last, parents)) = elms.split_last() else {
            return self.open_root(mode);
        };

        let mut dir = self.open_root(OPEN_RO)?;
        for elm in parents {
            dir = dir.open(elm, OPEN_RO)?;
        }
        dir.open(last, mode)
    }

    fn create_directory(&self, path: &str) -> Result<()> {
        let elms = split_path(path);
        let (last, parents) = elms.split_last().ok_or(Error::InvalidData)?;

        let mut dir = self.open_root(if parents.is_empty() { OPEN_RW } else { OPEN_RO })?;
        for (i, elm) in parents.iter().enumerate() {
            let mode = if i == parents.len() - 1 {
                OPEN_RW
            } else {
                OPEN_RO
            };
            dir = dir.open(elm, mode)?;
        }
        dir.create(last, FileType::Directory)
    }

    fn mount(&self, source: &str, mountpoint: &str) -> Result<()> {
        let (driver, volume_root): (Arc<dyn Driver>, Arc<FileOperator>) = match source {
            "devfs" => (self.devfs.clone(), self.devfs_root.clone()),
            "tmpfs" => {
                let driver = Arc::new(TmpDriver::new());
                let root = FileOperator::from_abstract(
                    driver.root_abstract(),
                    driver.clone(),
                    Weak::new(),
                );
                (driver, root)
            }
            // block-device sources need an on-disk filesystem driver
            _ => return Err(Error::UnknownFilesystem),
        };

        // Pin the mountpoint with a write handle; a missing path on the
        // synthetic tree is created on the spot.
        let pin = match self.open(mountpoint, OPEN_RW) {
            Ok(handle) => handle,
            Err(Error::NoSuchFile) => {
                self.create_directory(mountpoint)?;
                self.open(mountpoint, OPEN_RW)?
            }
            Err(e) => return Err(e),
        };

        let mut mounts = self.mounts.access();
        pin.fop().set_overlay(Some(volume_root.clone()));
        mounts.push(MountRecord {
            source: source.to_owned(),
            mountpoint: normalize_path(mountpoint),
            _driver: driver,
            root: volume_root,
            pin,
        });
        Ok(())
    }

    fn unmount(&self, mountpoint: &str) -> Result<()> {
        let path = normalize_path(mountpoint);
        let mut mounts = self.mounts.access();
        for i in (0..mounts.len()).rev() {
            if mounts[i].mountpoint != path {
                continue;
            }
            if mounts[i].root.is_busy() {
                return Err(Error::VolumeBusy);
            }
            mounts[i].pin.fop().set_overlay(None);
            // dropping the record closes the pin and releases the driver
            mounts.remove(i);
            return Ok(());
        }
        Err(Error::NotMounted)
    }

    fn mounts(&self) -> Vec<(String, String)> {
        self.mounts
            .access()
            .iter()
            .map(|r| (r.source.clone(), r.mountpoint.clone()))
            .collect()
    }
}

fn manager() -> &'static FsManager {
    FS.get().expect("filesystem::init not called")
}

pub fn init() {
    FS.try_init_once(|| {
        let basic = Arc::new(BasicDriver::new());
        let devfs = Arc::new(DevDriver::new());
        let root = FileOperator::from_abstract(
            basic.root_abstract(),
            basic.clone() as Arc<dyn Driver>,
            Weak::new(),
        );
        let devfs_root = FileOperator::from_abstract(
            devfs.root_abstract(),
            devfs.clone() as Arc<dyn Driver>,
            Weak::new(),
        );
        FsManager {
            _basic: basic,
            devfs,
            root,
            devfs_root,
            mounts: Critical::new(Vec::new()),
        }
    })
    .expect("filesystem::init called twice");

    mount("devfs", "/dev").expect("failed to mount devfs");
}

pub fn open(path: &str, mode: OpenMode) -> Result<Handle> {
    manager().open(path, mode)
}

pub fn mount(source: &str, mountpoint: &str) -> Result<()> {
    manager().mount(source, mountpoint)
}

pub fn unmount(mountpoint: &str) -> Result<()> {
    manager().unmount(mountpoint)
}

pub fn mounts() -> Vec<(String, String)> {
    manager().mounts()
}

pub fn create_device_file(name: &str, device: Arc<dyn Device>) -> Result<()> {
    let mut dev = open("/dev", OPEN_RW)?;
    dev.create_device(name, device)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn paths_split_on_slashes_only() {
        assert_eq!(split_path("/a/b/c"), ["a", "b", "c"]);
        assert_eq!(split_path("//a///b/"), ["a", "b"]);
        assert!(split_path("/").is_empty());
        assert!(split_path("").is_empty());
    }

    #[test_case]
    fn normalization_is_idempotent() {
        assert_eq!(normalize_path("//tmp//x/"), "/tmp/x");
        assert_eq!(normalize_path("/tmp/x"), "/tmp/x");
        assert_eq!(normalize_path(""), "/");
    }
}

/// Registers the boot devices: console, keyboard, framebuffer and a small
/// memory-backed disk with one partition.
pub fn register_boot_devices(framebuffer: Option<devfs::FramebufferDevice>) {
    if let Err(e) = create_device_file("console", Arc::new(devfs::ConsoleDevice)) {
        kernel_log!("fs: failed to register console: {:?}", e);
    }

    let keyboard = Arc::new(devfs::KeyboardDevice::new());
    devfs::set_boot_keyboard(keyboard.clone());
    if let Err(e) = create_device_file("keyboard-ps2", keyboard) {
        kernel_log!("fs: failed to register keyboard: {:?}", e);
    }

    if let Some(fb) = framebuffer {
        if let Err(e) = create_device_file("fb0", Arc::new(fb)) {
            kernel_log!("fs: failed to register framebuffer: {:?}", e);
        }
    }

    // a scratch disk so the block and partition paths have something to run on
    let disk = Arc::new(devfs::RamBlockDevice::new(512, 8192));
    match devfs::PartitionBlockDevice::new(disk.clone(), 2048, 8192 - 2048) {
        Ok(partition) => {
            if let Err(e) = create_device_file("disk0", disk) {
                kernel_log!("fs: failed to register disk0: {:?}", e);
            }
            if let Err(e) = create_device_file("disk0p0", Arc::new(partition)) {
                kernel_log!("fs: failed to register disk0p0: {:?}", e);
            }
        }
        Err(e) => kernel_log!("fs: failed to build partition device: {:?}", e),
    }
}

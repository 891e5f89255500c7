//! VFS behaviour: mounts and overlays, open-level enforcement, counter
//! arithmetic, FOP collapse, and the shared block/partition cache.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(kernel::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use alloc::sync::Arc;

use bootloader_api::BootInfo;
use kernel::error::Error;
use kernel::filesystem::{self, devfs};
use kernel::filesystem::vfs::{
    Attributes, DeviceControl, DeviceOperation, DeviceType, FileType, OPEN_RO, OPEN_RW,
    OPEN_WO, OpenLevel,
};
use kernel::memory;

bootloader_api::entry_point!(main, config = &kernel::BOOTLOADER_CONFIG);

fn main(boot_info: &'static mut BootInfo) -> ! {
    kernel::init(boot_info);
    test_main();
    loop {
        x86_64::instructions::hlt();
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    kernel::test_panic_handler(info)
}

#[test_case]
fn root_lists_dev() {
    let mut root = filesystem::open("/", OPEN_RO).unwrap();
    let first = root.readdir(0).unwrap();
    assert_eq!(first.name, "dev");
    assert_eq!(first.kind, FileType::Directory);
}

#[test_case]
fn devfs_lists_boot_devices() {
    let mut dev = filesystem::open("/dev", OPEN_RO).unwrap();
    let mut names = alloc::vec::Vec::new();
    for index in 0.. {
        match dev.readdir(index) {
            Ok(entry) => names.push(entry.name),
            Err(Error::EndOfFile) => break,
            Err(e) => panic!("readdir failed: {e:?}"),
        }
    }
    assert!(names.iter().any(|n| n == "console"));
    assert!(names.iter().any(|n| n == "keyboard-ps2"));
    assert!(names.iter().any(|n| n == "disk0"));
    assert!(names.iter().any(|n| n == "disk0p0"));
}

#[test_case]
fn tmpfs_round_trip_and_unmount_busy() {
    let frames_before = memory::free_frames();

    // S1: mount, create, write, read back
    filesystem::mount("tmpfs", "/tmp").unwrap();
    {
        let mut dir = filesystem::open("/tmp", OPEN_RW).unwrap();
        dir.create("hello", FileType::Regular).unwrap();
    }
    {
        let mut file = filesystem::open("/tmp/hello", OPEN_RW).unwrap();
        assert_eq!(file.write(0, b"world").unwrap(), 5);
    }
    {
        let mut file = filesystem::open("/tmp/hello", OPEN_RO).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(file.read(0, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"world");
    }

    // the mount overlays the (empty) underlying directory
    {
        let mut dir = filesystem::open("/tmp", OPEN_RO).unwrap();
        assert_eq!(dir.readdir(0).unwrap().name, "hello");
    }

    // S2: a held handle keeps the volume busy
    let file = filesystem::open("/tmp/hello", OPEN_RO).unwrap();
    assert_eq!(filesystem::unmount("/tmp"), Err(Error::VolumeBusy));
    file.close();
    filesystem::unmount("/tmp").unwrap();

    // underlying directory is back, and empty
    {
        let mut dir = filesystem::open("/tmp", OPEN_RO).unwrap();
        assert_eq!(dir.readdir(0).unwrap_err(), Error::EndOfFile);
    }
    assert_eq!(filesystem::unmount("/tmp"), Err(Error::NotMounted));

    // tmpfs frames went back with the driver
    assert_eq!(memory::free_frames(), frames_before);
}

#[test_case]
fn open_counts_track_live_handles() {
    filesystem::mount("tmpfs", "/counts").unwrap();
    {
        let mut dir = filesystem::open("/counts", OPEN_RW).unwrap();
        dir.create("file", FileType::Regular).unwrap();
    }

    let handle = filesystem::open("/counts/file", OPEN_RW).unwrap();
    let fop = handle.fop().clone();
    assert_eq!(fop.counts(), (1, 1));

    handle.close();
    assert_eq!(fop.counts(), (0, 0));

    let handle = filesystem::open("/counts/file", OPEN_WO).unwrap();
    assert_eq!(handle.fop().counts(), (0, 1));
    handle.close();

    filesystem::unmount("/counts").unwrap();
}

#[test_case]
fn unused_fops_collapse_bottom_up() {
    filesystem::mount("tmpfs", "/collapse").unwrap();
    let mut dir = filesystem::open("/collapse", OPEN_RW).unwrap();
    dir.create("leaf", FileType::Regular).unwrap();

    let volume_root = dir.fop().clone();
    let leaf = filesystem::open("/collapse/leaf", OPEN_RO).unwrap();
    assert!(volume_root.has_child("leaf"));

    leaf.close();
    assert!(!volume_root.has_child("leaf"));

    drop(dir);
    filesystem::unmount("/collapse").unwrap();
}

#[test_case]
fn exclusive_single_device_open_matrix() {
    // S3: keyboard is read-single, write-blocked, exclusive
    let first = filesystem::open("/dev/keyboard-ps2", OPEN_RO).unwrap();
    assert_eq!(
        filesystem::open("/dev/keyboard-ps2", OPEN_RO).unwrap_err(),
        Error::FileOpened
    );
    assert_eq!(
        filesystem::open("/dev/keyboard-ps2", OPEN_WO).unwrap_err(),
        Error::InvalidOpenMode
    );
    first.close();

    // fresh opener succeeds again after close
    filesystem::open("/dev/keyboard-ps2", OPEN_RO).unwrap().close();
}

struct MultiDevice;

impl devfs::Device for MultiDevice {
    fn device_type(&self) -> DeviceType {
        DeviceType::None
    }

    fn attributes(&self) -> Attributes {
        Attributes {
            read_level: OpenLevel::Multi,
            write_level: OpenLevel::Multi,
            exclusive: false,
            volume_root: false,
            cache: false,
            keep_on_close: false,
        }
    }
}

struct ExclusiveMultiDevice;

impl devfs::Device for ExclusiveMultiDevice {
    fn device_type(&self) -> DeviceType {
        DeviceType::None
    }

    fn attributes(&self) -> Attributes {
        Attributes {
            read_level: OpenLevel::Multi,
            write_level: OpenLevel::Multi,
            exclusive: true,
            volume_root: false,
            cache: false,
            keep_on_close: false,
        }
    }
}

#[test_case]
fn open_levels_and_exclusivity() {
    filesystem::create_device_file("multi", Arc::new(MultiDevice)).unwrap();
    let a = filesystem::open("/dev/multi", OPEN_RO).unwrap();
    let b = filesystem::open("/dev/multi", OPEN_RO).unwrap();
    let c = filesystem::open("/dev/multi", OPEN_WO).unwrap();
    assert_eq!(a.fop().counts(), (2, 1));
    a.close();
    b.close();
    c.close();

    filesystem::create_device_file("exclusive", Arc::new(ExclusiveMultiDevice)).unwrap();
    let readers = filesystem::open("/dev/exclusive", OPEN_RO).unwrap();
    // same-direction multi is fine
    let another = filesystem::open("/dev/exclusive", OPEN_RO).unwrap();
    // but the opposite direction is refused while readers exist
    assert_eq!(
        filesystem::open("/dev/exclusive", OPEN_WO).unwrap_err(),
        Error::FileOpened
    );
    readers.close();
    another.close();
    filesystem::open("/dev/exclusive", OPEN_WO).unwrap().close();
}

#[test_case]
fn partition_shares_the_disk_cache() {
    const SECTOR: usize = 512;
    const PART_START: usize = 2048;

    // write through the raw disk at the partition's first sector
    {
        let mut disk = filesystem::open("/dev/disk0", OPEN_RW).unwrap();
        assert_eq!(disk.blocksize(), SECTOR);
        assert_eq!(
            disk.write(PART_START * SECTOR, b"cached-by-parent").unwrap(),
            16
        );
    }

    // the partition view reads the same bytes at offset zero
    {
        let mut part = filesystem::open("/dev/disk0p0", OPEN_RW).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(part.read(0, &mut buf).unwrap(), 16);
        assert_eq!(&buf, b"cached-by-parent");

        // and writes through the partition appear on the raw device
        assert_eq!(part.write(SECTOR, b"cached-by-child").unwrap(), 15);
    }
    {
        let mut disk = filesystem::open("/dev/disk0", OPEN_RO).unwrap();
        let mut buf = [0u8; 15];
        assert_eq!(disk.read((PART_START + 1) * SECTOR, &mut buf).unwrap(), 15);
        assert_eq!(&buf, b"cached-by-child");
    }
}

#[test_case]
fn keyboard_exposes_its_write_event() {
    let mut keyboard = filesystem::open("/dev/keyboard-ps2", OPEN_RO).unwrap();
    let event = keyboard.write_event().unwrap();
    assert!(kernel::scheduler::event_waiters(event).unwrap().is_empty());

    // devices without one report NotSupported
    let mut console = filesystem::open("/dev/console", OPEN_WO).unwrap();
    assert_eq!(console.write_event().unwrap_err(), Error::NotSupported);
}

#[test_case]
fn block_device_reports_its_geometry() {
    let mut disk = filesystem::open("/dev/disk0", OPEN_RO).unwrap();
    assert_eq!(disk.device_type().unwrap(), DeviceType::Block);
    match disk.control_device(DeviceOperation::GetBytesPerSector).unwrap() {
        DeviceControl::BytesPerSector(bytes) => assert_eq!(bytes, 512),
        other => panic!("unexpected control response: {other:?}"),
    }
}

#[test_case]
fn remove_refuses_open_files() {
    filesystem::mount("tmpfs", "/rm").unwrap();
    {
        let mut dir = filesystem::open("/rm", OPEN_RW).unwrap();
        dir.create("victim", FileType::Regular).unwrap();
    }

    let victim = filesystem::open("/rm/victim", OPEN_RO).unwrap();
    {
        let mut dir = filesystem::open("/rm", OPEN_RW).unwrap();
        assert_eq!(dir.remove("victim"), Err(Error::FileOpened));
    }
    victim.close();
    {
        let mut dir = filesystem::open("/rm", OPEN_RW).unwrap();
        dir.remove("victim").unwrap();
        assert_eq!(dir.find("victim").unwrap_err(), Error::NoSuchFile);
    }
    filesystem::unmount("/rm").unwrap();
}

#[test_case]
fn mount_table_and_unknown_sources() {
    assert!(
        filesystem::mounts()
            .iter()
            .any(|(source, path)| source == "devfs" && path == "/dev")
    );
    assert_eq!(
        filesystem::mount("/dev/disk0p0", "/mnt"),
        Err(Error::UnknownFilesystem)
    );
    assert_eq!(
        filesystem::open("/no/such/path", OPEN_RO).unwrap_err(),
        Error::NoSuchFile
    );
}

//! Device filesystem: a flat directory of registered devices. Drivers hand
//! the VFS a `Device` trait object per file; the devfs driver is just the
//! registry and the dispatch glue.

use alloc::borrow::ToOwned;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use conquer_once::spin::OnceCell;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::console;
use crate::error::{Error, Result};
use crate::memory::FRAME_SIZE;
use crate::scheduler::{self, EventId, mutex::Critical};

use super::cache::{CacheProvider, DefaultCacheProvider, PartitionCacheProvider};
use super::vfs::{
    Attributes, DEFAULT_ATTRIBUTES, DeviceControl, DeviceOperation, DeviceType, Driver,
    FileAbstract, FileAbstractWithData, FileType, OpenLevel, VOLUME_ROOT_ATTRIBUTES,
};

/// One decoded key press, the unit the keyboard device trades in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct KeyPacket {
    pub keycode: u8,
    pub modifier: u8,
    pub ascii: u8,
    _padding: u8,
}

impl KeyPacket {
    pub fn new(keycode: u8, modifier: u8, ascii: u8) -> Self {
        KeyPacket {
            keycode,
            modifier,
            ascii,
            _padding: 0,
        }
    }
}

/// What a concrete device implements. Reads and writes are block-granular
/// like the driver contract; everything else has workable defaults.
pub trait Device: Send + Sync {
    fn read(
        &self,
        _handle_data: &mut u64,
        _block: usize,
        _count: usize,
        _buffer: &mut [u8],
    ) -> Result<usize> {
        Err(Error::NotSupported)
    }

    fn write(
        &self,
        _handle_data: &mut u64,
        _block: usize,
        _count: usize,
        _buffer: &[u8],
    ) -> Result<usize> {
        Err(Error::NotSupported)
    }

    fn filesize(&self) -> usize {
        0
    }

    fn create_handle_data(&self) -> Result<u64> {
        Ok(0)
    }

    fn destroy_handle_data(&self, _handle_data: &mut u64) -> Result<()> {
        Ok(())
    }

    fn on_handle_create(&self, _handle_data: &mut u64) {}

    fn on_handle_destroy(&self, _handle_data: &mut u64) {}

    fn write_event(&self, _handle_data: &mut u64) -> Option<EventId> {
        None
    }

    fn cache_provider(&self) -> Option<Arc<dyn CacheProvider>> {
        None
    }

    fn device_type(&self) -> DeviceType;

    fn attributes(&self) -> Attributes {
        DEFAULT_ATTRIBUTES
    }

    fn blocksize_exp(&self) -> u8 {
        0
    }

    fn control(&self, _op: DeviceOperation) -> Result<DeviceControl> {
        Err(Error::InvalidDeviceOperation)
    }
}

struct DevEntry {
    name: String,
    device: Arc<dyn Device>,
}

const ROOT_DATA: u64 = 0;

pub struct DevDriver {
    devices: Critical<Vec<Option<DevEntry>>>,
}

impl DevDriver {
    pub fn new() -> Self {
        DevDriver {
            devices: Critical::new(Vec::new()),
        }
    }

    pub fn root_abstract(&self) -> FileAbstractWithData {
        FileAbstractWithData {
            abstract_: FileAbstract {
                name: "/".to_owned(),
                filesize: 0,
                kind: FileType::Directory,
                blocksize_exp: 0,
                attributes: VOLUME_ROOT_ATTRIBUTES,
            },
            fop_data: ROOT_DATA,
        }
    }

    fn entry_abstract(index: usize, entry: &DevEntry) -> FileAbstractWithData {
        FileAbstractWithData {
            abstract_: FileAbstract {
                name: entry.name.clone(),
                filesize: entry.device.filesize(),
                kind: FileType::Device,
                blocksize_exp: entry.device.blocksize_exp(),
                attributes: entry.device.attributes(),
            },
            fop_data: index as u64 + 1,
        }
    }

    fn device(&self, fop_data: u64) -> Result<Arc<dyn Device>> {
        if fop_data == ROOT_DATA {
            return Err(Error::NotFile);
        }
        let devices = self.devices.access();
        devices
            .get(fop_data as usize - 1)
            .and_then(Option::as_ref)
            .map(|entry| entry.device.clone())
            .ok_or(Error::NoSuchFile)
    }
}

impl Driver for DevDriver {
    fn read(
        &self,
        fop_data: u64,
        handle_data: &mut u64,
        block: usize,
        count: usize,
        buffer: &mut [u8],
    ) -> Result<usize> {
        self.device(fop_data)?.read(handle_data, block, count, buffer)
    }

    fn write(
        &self,
        fop_data: u64,
        handle_data: &mut u64,
        block: usize,
        count: usize,
        buffer: &[u8],
    ) -> Result<usize> {
        self.device(fop_data)?
            .write(handle_data, block, count, buffer)
    }

    fn find(
        &self,
        fop_data: u64,
        _handle_data: &mut u64,
        name: &str,
    ) -> Result<FileAbstractWithData> {
        if fop_data != ROOT_DATA {
            return Err(Error::NotDirectory);
        }
        let devices = self.devices.access();
        devices
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|e| (i, e)))
            .find(|(_, e)| e.name == name)
            .map(|(i, e)| Self::entry_abstract(i, e))
            .ok_or(Error::NoSuchFile)
    }

    fn create(
        &self,
        _fop_data: u64,
        _handle_data: &mut u64,
        _name: &str,
        _kind: FileType,
    ) -> Result<FileAbstractWithData> {
        // devices appear through create_device, not create
        Err(Error::NotSupported)
    }

    fn readdir(
        &self,
        fop_data: u64,
        _handle_data: &mut u64,
        index: usize,
    ) -> Result<FileAbstractWithData> {
        if fop_data != ROOT_DATA {
            return Err(Error::NotDirectory);
        }
        let devices = self.devices.access();
        devices
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|e| (i, e)))
            .nth(index)
            .map(|(i, e)| Self::entry_abstract(i, e))
            .ok_or(Error::EndOfFile)
    }

    fn remove(&self, fop_data: u64, _handle_data: &mut u64, name: &str) -> Result<()> {
        if fop_data != ROOT_DATA {
            return Err(Error::NotDirectory);
        }
        let mut devices = self.devices.access();
        match devices
            .iter()
            .position(|e| e.as_ref().is_some_and(|e| e.name == name))
        {
            Some(i) => {
                devices[i] = None;
                Ok(())
            }
            None => Err(Error::NoSuchFile),
        }
    }

    fn device_type(&self, fop_data: u64) -> DeviceType {
        self.device(fop_data)
            .map(|d| d.device_type())
            .unwrap_or(DeviceType::None)
    }

    fn create_device(
        &self,
        fop_data: u64,
        _handle_data: &mut u64,
        name: &str,
        device: Arc<dyn Device>,
    ) -> Result<FileAbstractWithData> {
        if fop_data != ROOT_DATA {
            return Err(Error::NotDirectory);
        }
        if (1usize << device.blocksize_exp()) > FRAME_SIZE {
            // the page cache cannot span one block across pages
            return Err(Error::NotSupported);
        }
        let mut devices = self.devices.access();
        if devices
            .iter()
            .any(|e| e.as_ref().is_some_and(|e| e.name == name))
        {
            return Err(Error::FileExists);
        }
        let entry = DevEntry {
            name: name.to_owned(),
            device,
        };
        let index = match devices.iter().position(Option::is_none) {
            Some(i) => {
                devices[i] = Some(entry);
                i
            }
            None => {
                devices.push(Some(entry));
                devices.len() - 1
            }
        };
        Ok(Self::entry_abstract(
            index,
            devices[index].as_ref().unwrap(),
        ))
    }

    fn control_device(
        &self,
        fop_data: u64,
        _handle_data: &mut u64,
        op: DeviceOperation,
    ) -> Result<DeviceControl> {
        self.device(fop_data)?.control(op)
    }

    fn create_handle_data(&self, fop_data: u64) -> Result<u64> {
        if fop_data == ROOT_DATA {
            return Ok(0);
        }
        self.device(fop_data)?.create_handle_data()
    }

    fn destroy_handle_data(&self, fop_data: u64, handle_data: &mut u64) -> Result<()> {
        if fop_data == ROOT_DATA {
            return Ok(());
        }
        self.device(fop_data)?.destroy_handle_data(handle_data)
    }

    fn on_handle_create(&self, fop_data: u64, handle_data: &mut u64) {
        if let Ok(device) = self.device(fop_data) {
            device.on_handle_create(handle_data);
        }
    }

    fn on_handle_destroy(&self, fop_data: u64, handle_data: &mut u64) {
        if let Ok(device) = self.device(fop_data) {
            device.on_handle_destroy(handle_data);
        }
    }

    fn write_event(&self, fop_data: u64, handle_data: &mut u64) -> Option<EventId> {
        self.device(fop_data).ok()?.write_event(handle_data)
    }

    fn cache_provider(&self, fop_data: u64) -> Option<Arc<dyn CacheProvider>> {
        self.device(fop_data).ok()?.cache_provider()
    }
}

// --- concrete devices ---

static KEYBOARD: OnceCell<Arc<KeyboardDevice>> = OnceCell::uninit();

/// The boot keyboard, fed by the kernel thread from decoded scancodes.
pub fn keyboard() -> Option<Arc<KeyboardDevice>> {
    KEYBOARD.get().cloned()
}

pub(super) fn set_boot_keyboard(device: Arc<KeyboardDevice>) {
    let _ = KEYBOARD.try_init_once(|| device);
}

pub struct KeyboardDevice {
    packets: Critical<Vec<KeyPacket>>,
    active: AtomicBool,
    write_event: EventId,
}

impl KeyboardDevice {
    pub fn new() -> Self {
        KeyboardDevice {
            packets: Critical::new(Vec::new()),
            active: AtomicBool::new(false),
            write_event: scheduler::create_event(),
        }
    }

    /// Dropped unless somebody holds the device open.
    pub fn push_packet(&self, packet: KeyPacket) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        {
            let mut packets = self.packets.access();
            packets.push(packet);
        }
        let _ = scheduler::notify_event(self.write_event);
    }
}

impl Device for KeyboardDevice {
    fn read(
        &self,
        _handle_data: &mut u64,
        block: usize,
        count: usize,
        buffer: &mut [u8],
    ) -> Result<usize> {
        if block != 0 {
            return Err(Error::IndexOutOfRange);
        }

        loop {
            {
                let packets = self.packets.access();
                if !packets.is_empty() {
                    break;
                }
            }
            scheduler::wait_event(self.write_event)?;
        }

        let mut packets = self.packets.access();
        let n = count.min(packets.len());
        for (i, packet) in packets.iter().take(n).enumerate() {
            buffer[i * 4..(i + 1) * 4].copy_from_slice(&[
                packet.keycode,
                packet.modifier,
                packet.ascii,
                0,
            ]);
        }
        packets.drain(..n);
        Ok(n)
    }

    fn filesize(&self) -> usize {
        self.packets.access().len() * size_of::<KeyPacket>()
    }

    fn on_handle_create(&self, _handle_data: &mut u64) {
        self.active.store(true, Ordering::Release);
    }

    fn on_handle_destroy(&self, _handle_data: &mut u64) {
        self.active.store(false, Ordering::Release);
        self.packets.access().clear();
    }

    fn write_event(&self, _handle_data: &mut u64) -> Option<EventId> {
        Some(self.write_event)
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Keyboard
    }

    fn attributes(&self) -> Attributes {
        Attributes {
            read_level: OpenLevel::Single,
            write_level: OpenLevel::Block,
            exclusive: true,
            volume_root: false,
            cache: false,
            keep_on_close: false,
        }
    }

    fn blocksize_exp(&self) -> u8 {
        2
    }
}

/// Text sink over the boot console.
pub struct ConsoleDevice;

impl Device for ConsoleDevice {
    fn write(
        &self,
        _handle_data: &mut u64,
        _block: usize,
        count: usize,
        buffer: &[u8],
    ) -> Result<usize> {
        console::write_bytes(&buffer[..count.min(buffer.len())]);
        Ok(count)
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Console
    }

    fn attributes(&self) -> Attributes {
        Attributes {
            read_level: OpenLevel::Block,
            write_level: OpenLevel::Multi,
            exclusive: false,
            volume_root: false,
            cache: false,
            keep_on_close: false,
        }
    }
}

/// Raw access to the boot framebuffer; consumers draw through the direct
/// pointer rather than write().
pub struct FramebufferDevice {
    base: *mut u8,
    width: usize,
    height: usize,
    len: usize,
}

unsafe impl Send for FramebufferDevice {}
unsafe impl Sync for FramebufferDevice {}

impl FramebufferDevice {
    pub fn new(base: *mut u8, width: usize, height: usize, len: usize) -> Self {
        FramebufferDevice {
            base,
            width,
            height,
            len,
        }
    }
}

impl Device for FramebufferDevice {
    fn filesize(&self) -> usize {
        self.len
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Framebuffer
    }

    fn attributes(&self) -> Attributes {
        Attributes {
            cache: false,
            ..DEFAULT_ATTRIBUTES
        }
    }

    fn control(&self, op: DeviceOperation) -> Result<DeviceControl> {
        match op {
            DeviceOperation::GetSize => Ok(DeviceControl::Size(self.width, self.height)),
            DeviceOperation::GetDirectPointer => Ok(DeviceControl::Pointer(self.base)),
            DeviceOperation::IsDoubleBuffered => Ok(DeviceControl::Flag(false)),
            DeviceOperation::Swap => Ok(DeviceControl::None),
            _ => Err(Error::InvalidDeviceOperation),
        }
    }
}

/// Memory-backed block device, 512-byte sectors.
pub struct RamBlockDevice {
    storage: Critical<Vec<u8>>,
    bytes_per_sector: usize,
    cache: Arc<DefaultCacheProvider>,
}

impl RamBlockDevice {
    pub fn new(bytes_per_sector: usize, total_sectors: usize) -> Self {
        RamBlockDevice {
            storage: Critical::new(alloc::vec![0u8; bytes_per_sector * total_sectors]),
            bytes_per_sector,
            cache: Arc::new(DefaultCacheProvider::new()),
        }
    }

    pub fn bytes_per_sector(&self) -> usize {
        self.bytes_per_sector
    }
}

impl Device for RamBlockDevice {
    fn read(
        &self,
        _handle_data: &mut u64,
        block: usize,
        count: usize,
        buffer: &mut [u8],
    ) -> Result<usize> {
        let storage = self.storage.access();
        let offset = block * self.bytes_per_sector;
        if offset >= storage.len() {
            return Err(Error::IndexOutOfRange);
        }
        let n = count.min((storage.len() - offset) / self.bytes_per_sector);
        let bytes = n * self.bytes_per_sector;
        buffer[..bytes].copy_from_slice(&storage[offset..offset + bytes]);
        Ok(n)
    }

    fn write(
        &self,
        _handle_data: &mut u64,
        block: usize,
        count: usize,
        buffer: &[u8],
    ) -> Result<usize> {
        let mut storage = self.storage.access();
        let offset = block * self.bytes_per_sector;
        if offset >= storage.len() {
            return Err(Error::IndexOutOfRange);
        }
        let n = count.min((storage.len() - offset) / self.bytes_per_sector);
        let bytes = n * self.bytes_per_sector;
        storage[offset..offset + bytes].copy_from_slice(&buffer[..bytes]);
        Ok(n)
    }

    fn filesize(&self) -> usize {
        self.storage.access().len()
    }

    fn cache_provider(&self) -> Option<Arc<dyn CacheProvider>> {
        Some(self.cache.clone())
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Block
    }

    fn blocksize_exp(&self) -> u8 {
        self.bytes_per_sector.trailing_zeros() as u8
    }

    fn control(&self, op: DeviceOperation) -> Result<DeviceControl> {
        match op {
            DeviceOperation::GetBytesPerSector => {
                Ok(DeviceControl::BytesPerSector(self.bytes_per_sector))
            }
            _ => Err(Error::InvalidDeviceOperation),
        }
    }
}

/// A window into a parent block device. Shares the parent's cache shifted by
/// the partition offset, so both views cache a physical sector once.
pub struct PartitionBlockDevice {
    base: Arc<dyn Device>,
    first_sector: usize,
    total_sectors: usize,
    cache: Arc<PartitionCacheProvider>,
}

impl PartitionBlockDevice {
    /// `first_sector` must be page-aligned in sectors, or the shared cache
    /// pages would straddle the partition boundary.
    pub fn new(base: Arc<dyn Device>, first_sector: usize, total_sectors: usize) -> Result<Self> {
        let blocks_per_page = FRAME_SIZE >> base.blocksize_exp();
        if first_sector % blocks_per_page != 0 {
            return Err(Error::InvalidData);
        }
        let parent_cache = base.cache_provider().ok_or(Error::NotSupported)?;
        Ok(PartitionBlockDevice {
            cache: Arc::new(PartitionCacheProvider::new(
                first_sector,
                blocks_per_page,
                parent_cache,
            )),
            base,
            first_sector,
            total_sectors,
        })
    }
}

impl Device for PartitionBlockDevice {
    fn read(
        &self,
        handle_data: &mut u64,
        block: usize,
        count: usize,
        buffer: &mut [u8],
    ) -> Result<usize> {
        if block >= self.total_sectors {
            return Err(Error::IndexOutOfRange);
        }
        let count = count.min(self.total_sectors - block);
        self.base
            .read(handle_data, block + self.first_sector, count, buffer)
    }

    fn write(
        &self,
        handle_data: &mut u64,
        block: usize,
        count: usize,
        buffer: &[u8],
    ) -> Result<usize> {
        if block >= self.total_sectors {
            return Err(Error::IndexOutOfRange);
        }
        let count = count.min(self.total_sectors - block);
        self.base
            .write(handle_data, block + self.first_sector, count, buffer)
    }

    fn filesize(&self) -> usize {
        self.total_sectors << self.base.blocksize_exp()
    }

    fn cache_provider(&self) -> Option<Arc<dyn CacheProvider>> {
        Some(self.cache.clone())
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Block
    }

    fn blocksize_exp(&self) -> u8 {
        self.base.blocksize_exp()
    }

    fn control(&self, op: DeviceOperation) -> Result<DeviceControl> {
        self.base.control(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn key_packets_are_four_bytes() {
        assert_eq!(size_of::<KeyPacket>(), 4);
    }

    #[test_case]
    fn keyboard_drops_input_while_unopened() {
        let keyboard = KeyboardDevice::new();
        keyboard.push_packet(KeyPacket::new(0x1e, 0, b'a'));
        assert_eq!(keyboard.filesize(), 0);

        let mut hd = 0u64;
        keyboard.on_handle_create(&mut hd);
        keyboard.push_packet(KeyPacket::new(0x1e, 0, b'a'));
        assert_eq!(keyboard.filesize(), 4);

        keyboard.on_handle_destroy(&mut hd);
        assert_eq!(keyboard.filesize(), 0);
    }

    #[test_case]
    fn partitions_reject_unaligned_starts() {
        let disk = Arc::new(RamBlockDevice::new(512, 64));
        assert!(PartitionBlockDevice::new(disk.clone(), 3, 8).is_err());
        assert!(PartitionBlockDevice::new(disk, 8, 8).is_ok());
    }
}

#![no_std]
#![no_main]

extern crate alloc;

use alloc::vec::Vec;

use bootloader_api::BootInfo;
use pc_keyboard::{DecodedKey, HandleControl, Keyboard, ScancodeSet1, layouts::Us104Key};

use kernel::filesystem::devfs::{self, KeyPacket};
use kernel::filesystem::{self, vfs::FileType, vfs::OPEN_RO, vfs::OPEN_RW};
use kernel::memory::{self, FRAME_SIZE};
use kernel::message::{self, Message};
use kernel::{kernel_log, paging, scheduler, user};

bootloader_api::entry_point!(kernel_main, config = &kernel::BOOTLOADER_CONFIG);

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    kernel::init(boot_info);
    kernel_log!("boot complete");

    if let Err(e) = spawn_init() {
        kernel_log!("init: failed to start the first process: {:?}", e);
    }

    kernel_thread_main()
}

/// The kernel thread is the message pump: interrupt handlers enqueue, this
/// loop drains and dispatches, and sleeps on an empty queue.
fn kernel_thread_main() -> ! {
    let mut keyboard = Keyboard::new(ScancodeSet1::new(), Us104Key, HandleControl::Ignore);

    loop {
        match message::pop() {
            Some(Message::Keyboard(scancode)) => {
                let Ok(Some(event)) = keyboard.add_byte(scancode) else {
                    continue;
                };
                let ascii = match keyboard.process_keyevent(event) {
                    Some(DecodedKey::Unicode(c)) if c.is_ascii() => c as u8,
                    _ => 0,
                };
                if let Some(device) = devfs::keyboard() {
                    device.push_packet(KeyPacket::new(scancode, 0, ascii));
                }
            }
            Some(Message::LapicTimer) => {}
            None => scheduler::sleep_this_thread(),
        }
    }
}

/// No disk filesystem is wired in, so the init binary is baked into the
/// kernel; it still travels the real route: written to a tmpfs file, read
/// back through the VFS into frames, then loaded as the first user process.
fn spawn_init() -> Result<(), kernel::error::Error> {
    let image_bytes = init_binary();

    filesystem::mount("tmpfs", "/bin")?;
    {
        let mut dir = filesystem::open("/bin", OPEN_RW)?;
        dir.create("init", FileType::Regular)?;
    }
    {
        let mut file = filesystem::open("/bin/init", OPEN_RW)?;
        file.write(0, &image_bytes)?;
    }

    let mut image = memory::allocate(image_bytes.len().div_ceil(FRAME_SIZE))?;
    {
        let mut file = filesystem::open("/bin/init", OPEN_RO)?;
        file.read(0, &mut image.bytes_mut()[..image_bytes.len()])?;
    }

    let (pid, tid) = user::create_user_process(image)?;
    kernel_log!("init: started as process {}.{}", pid, tid);
    Ok(())
}

/// A hand-assembled static ELF: printk("hello from userspace"), then exit.
fn init_binary() -> Vec<u8> {
    let vaddr = paging::USER_BASE + 0x40_0000;

    let mut code = alloc::vec![
        0x48, 0xC7, 0xC0, 0x00, 0x00, 0x00, 0x00, // mov rax, 0 (printk)
        0x48, 0x8D, 0x3D, 0x0B, 0x00, 0x00, 0x00, // lea rdi, [rip + 11] -> message
        0x0F, 0x05, // syscall
        0x48, 0xC7, 0xC0, 0x01, 0x00, 0x00, 0x00, // mov rax, 1 (exit)
        0x0F, 0x05, // syscall
    ];
    code.extend_from_slice(b"hello from userspace\0");

    let mut image = Vec::new();
    image.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    image.extend_from_slice(&[0u8; 8]);
    image.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    image.extend_from_slice(&0x3eu16.to_le_bytes()); // x86-64
    image.extend_from_slice(&1u32.to_le_bytes());
    image.extend_from_slice(&vaddr.to_le_bytes()); // entry
    image.extend_from_slice(&64u64.to_le_bytes()); // phoff
    image.extend_from_slice(&0u64.to_le_bytes()); // shoff
    image.extend_from_slice(&0u32.to_le_bytes()); // flags
    image.extend_from_slice(&64u16.to_le_bytes()); // ehsize
    image.extend_from_slice(&56u16.to_le_bytes()); // phentsize
    image.extend_from_slice(&1u16.to_le_bytes()); // phnum
    image.extend_from_slice(&[0u8; 6]); // no section headers
    image.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    image.extend_from_slice(&5u32.to_le_bytes()); // R+X
    image.extend_from_slice(&0x1000u64.to_le_bytes()); // offset
    image.extend_from_slice(&vaddr.to_le_bytes());
    image.extend_from_slice(&vaddr.to_le_bytes());
    image.extend_from_slice(&(code.len() as u64).to_le_bytes()); // filesz
    image.extend_from_slice(&(code.len() as u64).to_le_bytes()); // memsz
    image.extend_from_slice(&0x1000u64.to_le_bytes()); // align
    image.resize(0x1000, 0);
    image.extend_from_slice(&code);
    image
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    kernel::panic::handle_panic(info)
}

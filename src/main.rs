use std::env;

fn main() {
    // read env variables that were set in build script
    let uefi_path = env!("UEFI_PATH");

    println!("UEFI image: {:?}", uefi_path);

    let mut cmd = std::process::Command::new("qemu-system-x86_64");
    if let Some(x) = env::args().nth(1) {
        if x == "DEBUG" {
            cmd.arg("-s");
            cmd.arg("-S");
        };
    };
    cmd.arg("-debugcon").arg("stdio");
    cmd.arg("-device")
        .arg("isa-debug-exit,iobase=0xf4,iosize=0x04");
    cmd.arg("-bios").arg(ovmf_prebuilt::ovmf_pure_efi());
    cmd.arg("-drive")
        .arg(format!("format=raw,file={uefi_path}"));

    let mut child = cmd.spawn().unwrap();
    child.wait().unwrap();
}

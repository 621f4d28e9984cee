pub mod command;
pub mod qemu_disk;
pub mod qemu_runner;
pub mod vm_process;
pub mod wsl_disk;
pub mod wsl_runner;

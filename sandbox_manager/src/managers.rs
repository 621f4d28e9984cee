pub mod planner;
pub mod resources;
pub mod sandbox;
pub mod sandbox_manager;
pub mod virtual_disk;
pub mod virtual_machine;
pub mod vm_manager;
pub mod vm_runtime;

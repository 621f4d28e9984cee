pub mod sandbox_fabric;
pub mod vm_fabric;

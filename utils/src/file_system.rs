pub mod fs_repository;
pub mod workspace_manager;

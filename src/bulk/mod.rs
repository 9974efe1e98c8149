//! Bulk-load line parsing (SPEC_FULL §6.3), feeding
//! `TableManager::load_from_file`.

pub mod loader;

pub use loader::parse_line;

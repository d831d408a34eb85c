pub mod ignorelist;
pub mod memory;

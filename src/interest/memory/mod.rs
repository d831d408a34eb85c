pub mod access;
pub mod allocation;

pub mod race;
pub mod report;

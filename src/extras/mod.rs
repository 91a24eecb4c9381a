// klippy_nozzle_fan/src/extras/mod.rs
// Printer objects loaded from config sections.

pub mod fan;
pub mod fan_coordinator;
pub mod nozzle_cleaning_fan;
pub mod probe_clean_listener;

// klippy_nozzle_fan/src/lib.rs

// Host-side nozzle cleaning fan control: holds a part-cooling fan at a
// cleaning speed around nozzle wipes and suppresses it while probing.

pub mod configfile;
pub mod core_traits;
pub mod gcode;
pub mod printer;
pub mod reactor;

pub mod extras;

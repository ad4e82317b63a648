//! a2core - Apple IIe-class emulation core
//!
//! - 6502 / 65C02 CPU (table-driven)
//! - Bank-switched memory with soft switches and expansion slots
//! - Disk II controller with bit-level timing
//! - DSK / PO / NIB / WOZ 1/2 disk images
//! - Suspend / resume

pub mod apple2;
pub mod config;
pub mod cpu;
pub mod disk;
pub mod disk_log;
pub mod gcr;
pub mod image;
pub mod memory;
pub mod savestate;
pub mod slot;
pub mod storage;
pub mod woz;

#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod cli;
pub mod cloudinit;
pub mod config;
pub mod context;
pub mod error;
pub mod image;
pub mod launch;
pub mod lima;
pub mod logging;
pub mod network;
pub mod overlay;
pub mod paths;
pub mod qemu;
pub mod tool;
pub mod util;
pub mod vm;
pub mod vm_state;

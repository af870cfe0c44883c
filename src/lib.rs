//! DMA descriptor-ring engine of the NVIDIA Tegra `nvethernet` controller.
//!
//! The crate owns the transmit and receive descriptor rings of every
//! configured DMA channel, binds outgoing frames to descriptors, routes the
//! controller's interrupt lines to per-channel poll tasks and drains
//! completed descriptors from those tasks. Everything outside the DMA data
//! path (MAC/MTL register programming, buffer memory, DMA mapping, timers,
//! the network stack) is reached through the capability traits in
//! [`drivers::osi`] and [`drivers::net`].

#![cfg_attr(not(test), no_std)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]
#![allow(clippy::tabs_in_doc_comments)]

// EXTERNAL CRATES
extern crate alloc;
#[macro_use]
extern crate log;

#[macro_use]
pub mod logging;

pub mod arch;
pub mod config;
pub mod drivers;

pub use crate::config::DmaConfig;
pub use crate::drivers::error::DmaError;
pub use crate::drivers::net::nvethernet::Engine;

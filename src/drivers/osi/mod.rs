//! Hardware-facing DMA layer: descriptor layout, rings, buffer binding and
//! the capabilities the engine consumes from the platform.

pub mod binder;
pub mod buffer;
pub mod desc;
pub mod dma;
#[cfg(all(test, not(target_os = "none")))]
pub(crate) mod mock;
pub mod ring;

use crate::drivers::error::HwError;
use crate::drivers::osi::dma::DmaAddr;

/// Direction of one channel half. Also the low bit of the global
/// DMA status word (`bit = 2 * chan + direction`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Direction {
	Tx = 0,
	Rx = 1,
}

impl Direction {
	pub const fn from_status_bit(bit: u32) -> Self {
		if bit & 1 == 0 { Direction::Tx } else { Direction::Rx }
	}

	/// Bit of this channel half in the global DMA status word.
	pub const fn status_bit(self, chan: u32) -> u32 {
		2 * chan + self as u32
	}
}

/// Ring placement of one channel as handed to [`DmaHw::dma_init`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChanSetup {
	pub chan: u32,
	pub tx_ring: DmaAddr,
	pub tx_len: usize,
	pub rx_ring: DmaAddr,
	pub rx_len: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct DmaSetup<'a> {
	pub chans: &'a [ChanSetup],
	pub rx_buf_len: usize,
	pub tx_usecs: Option<u32>,
	pub tx_frames: Option<u32>,
	pub rx_riwt: Option<u32>,
	pub rx_frames: Option<u32>,
}

/// Register-level operations of one MAC generation.
///
/// One implementation exists per hardware generation (EQOS, MGBE); the
/// engine receives it once at construction and never switches it.
pub trait DmaHw: Send + Sync {
	/// Initializes MAC, MTL and the DMA common registers.
	fn core_init(&self, tx_fifo_size: u32, rx_fifo_size: u32) -> Result<(), HwError>;
	fn core_deinit(&self);
	/// Programs ring base, length and coalescing of every channel and
	/// starts the DMA engines.
	fn dma_init(&self, setup: &DmaSetup<'_>) -> Result<(), HwError>;
	fn dma_deinit(&self);
	fn start_mac(&self) -> Result<(), HwError>;
	/// Doorbell: `tail` is the first descriptor index not handed to hardware.
	fn transmit(&self, chan: u32, tail: usize);
	fn update_rx_tail(&self, chan: u32, tail: usize);
	fn set_dma_interrupt(&self, chan: u32, dir: Direction, enable: bool) -> Result<(), HwError>;
	/// Reads the pending-status word shared by all channels.
	fn global_dma_status(&self) -> Result<u32, HwError>;
	fn handle_common_interrupt(&self) -> Result<(), HwError>;
	/// Snapshots MAC registers that do not survive a power cycle.
	fn save_registers(&self) -> Result<(), HwError>;
	fn restore_registers(&self) -> Result<(), HwError>;
}

//! The DMA layer of the controller and the network-facing engine built on it.

pub mod net;
pub mod osi;

/// A common error module for the DMA engine.
/// [DmaError](error::DmaError) values are passed on to higher layers.
pub mod error {
	use thiserror::Error;

	use crate::config::ConfigError;
	use crate::drivers::net::nvethernet::ChanState;

	/// Failure code reported by the hardware abstraction layer.
	#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
	#[error("hardware abstraction returned {0}")]
	pub struct HwError(pub i32);

	#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
	pub enum DmaError {
		#[error("out of memory")]
		OutOfMemory,
		#[error("descriptor ring full")]
		WouldBlock,
		#[error("DMA mapping failed")]
		MappingFailed,
		#[error("hardware fault: {0}")]
		HardwareFault(#[from] HwError),
		#[error("DMA channel {0} is not configured")]
		InvalidChannel(u32),
		#[error("channel set is {found:?}, operation requires {expected:?}")]
		InvalidState {
			expected: ChanState,
			found: ChanState,
		},
		#[error("invalid configuration: {0}")]
		InvalidConfig(#[from] ConfigError),
		#[error("device busy")]
		Busy,
	}
}

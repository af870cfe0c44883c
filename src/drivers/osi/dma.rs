//! DMA mapping capability.

use core::ptr::NonNull;

use crate::drivers::error::DmaError;
use crate::drivers::osi::buffer::PacketBuffer;

/// Bus address as seen by the controller.
pub type DmaAddr = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmaDirection {
	ToDevice,
	FromDevice,
}

/// Streaming and coherent DMA mappings of the platform.
///
/// Every successful `map_*` call must be paired with exactly one `unmap_*`
/// call of the same kind and length.
pub trait DmaMapper: Send + Sync {
	/// Maps `len` bytes of a linear buffer starting at `offset`.
	fn map_single(
		&self,
		buf: &PacketBuffer,
		offset: usize,
		len: usize,
		dir: DmaDirection,
	) -> Result<DmaAddr, DmaError>;

	/// Maps part of a fragment page.
	fn map_page(
		&self,
		page: &PacketBuffer,
		offset: usize,
		len: usize,
		dir: DmaDirection,
	) -> Result<DmaAddr, DmaError>;

	fn unmap_single(&self, addr: DmaAddr, len: usize, dir: DmaDirection);

	fn unmap_page(&self, addr: DmaAddr, len: usize, dir: DmaDirection);

	/// Makes `len` bytes at `cpu` visible to the controller without
	/// cache maintenance (descriptor tables).
	fn map_coherent(&self, cpu: NonNull<u8>, len: usize) -> Result<DmaAddr, DmaError>;

	fn unmap_coherent(&self, addr: DmaAddr, len: usize);
}

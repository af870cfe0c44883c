//! Packet buffers and the frames built from them.

use alloc::boxed::Box;
use alloc::vec::Vec;

use smallvec::SmallVec;

use crate::drivers::error::DmaError;

/// An owned packet buffer.
///
/// Buffers move into a ring slot when they are handed to the controller and
/// move out again on completion; a slot never aliases a buffer it does not own.
#[derive(Debug, PartialEq, Eq)]
pub struct PacketBuffer {
	data: Box<[u8]>,
}

impl PacketBuffer {
	pub fn new(data: Box<[u8]>) -> Self {
		Self { data }
	}

	/// Allocates a zero-filled buffer, reporting exhaustion instead of aborting.
	pub fn zeroed(len: usize) -> Result<Self, DmaError> {
		let mut data = Vec::new();
		data.try_reserve_exact(len)
			.map_err(|_| DmaError::OutOfMemory)?;
		data.resize(len, 0);
		Ok(Self::new(data.into_boxed_slice()))
	}

	pub fn len(&self) -> usize {
		self.data.len()
	}

	pub fn is_empty(&self) -> bool {
		self.data.is_empty()
	}

	pub fn as_slice(&self) -> &[u8] {
		&self.data
	}

	pub fn as_mut_slice(&mut self) -> &mut [u8] {
		&mut self.data
	}

	pub fn into_inner(self) -> Box<[u8]> {
		self.data
	}
}

impl From<Vec<u8>> for PacketBuffer {
	fn from(data: Vec<u8>) -> Self {
		Self::new(data.into_boxed_slice())
	}
}

/// A paged fragment of a scatter/gather frame.
#[derive(Debug)]
pub struct Fragment {
	pub page: PacketBuffer,
	pub offset: usize,
	pub len: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GsoKind {
	Tcp,
	Udp,
}

/// Segmentation request of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Gso {
	pub kind: GsoKind,
	/// Segment size as requested by the stack, transport header excluded
	/// for TCP and included for UDP.
	pub size: u32,
	/// Offset of the transport header from the start of the frame.
	pub transport_offset: usize,
	/// TCP header length; ignored for UDP.
	pub tcp_hdr_len: usize,
}

pub const UDP_HDR_LEN: usize = 8;

/// A frame offered for transmission.
///
/// `data` is the linear part starting with the protocol headers; `frags`
/// carries the remaining payload.
#[derive(Debug)]
pub struct TxFrame {
	pub data: PacketBuffer,
	pub frags: SmallVec<[Fragment; 4]>,
	pub csum_offload: bool,
	pub gso: Option<Gso>,
	pub vlan_tci: Option<u16>,
	pub priority: u32,
	pub timestamp: bool,
	/// The header region is shared with another frame and must be made
	/// private before the controller may rewrite it.
	pub header_shared: bool,
}

impl TxFrame {
	pub fn new(data: PacketBuffer) -> Self {
		Self {
			data,
			frags: SmallVec::new(),
			csum_offload: false,
			gso: None,
			vlan_tci: None,
			priority: 0,
			timestamp: false,
			header_shared: false,
		}
	}

	pub fn with_frag(mut self, page: PacketBuffer, offset: usize, len: usize) -> Self {
		self.frags.push(Fragment { page, offset, len });
		self
	}

	pub fn with_gso(mut self, gso: Gso) -> Self {
		self.gso = Some(gso);
		self
	}

	pub fn with_vlan(mut self, tci: u16) -> Self {
		self.vlan_tci = Some(tci);
		self
	}

	pub fn with_timestamp(mut self) -> Self {
		self.timestamp = true;
		self
	}

	pub fn with_csum_offload(mut self) -> Self {
		self.csum_offload = true;
		self
	}

	/// Length of the linear part.
	pub fn headlen(&self) -> usize {
		self.data.len()
	}

	pub fn len(&self) -> usize {
		self.headlen() + self.frags.iter().map(|frag| frag.len).sum::<usize>()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Returns every buffer of the frame to `pool`.
	pub fn release(self, pool: &dyn BufferPool) {
		pool.release(self.data);
		for frag in self.frags {
			pool.release(frag.page);
		}
	}
}

/// Packet buffer allocator of the platform.
pub trait BufferPool: Send + Sync {
	fn alloc(&self, len: usize) -> Result<PacketBuffer, DmaError>;

	fn release(&self, buf: PacketBuffer);

	/// Gives `buf` a private copy of its first `len` bytes.
	fn unshare(&self, buf: &mut PacketBuffer, len: usize) -> Result<(), DmaError> {
		let _ = (buf, len);
		Ok(())
	}
}

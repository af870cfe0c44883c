//! Binding of packet buffers to ring slots.
//!
//! [`bind`] claims and maps the slots of one transmit frame without touching
//! the descriptors; the ring publishes them afterwards. Either every slot of
//! the frame is claimed or, on failure, none is.

use bitflags::bitflags;

use crate::drivers::error::DmaError;
use crate::drivers::osi::buffer::{
	BufferPool, Fragment, GsoKind, PacketBuffer, TxFrame, UDP_HDR_LEN,
};
use crate::drivers::osi::dma::{DmaDirection, DmaMapper};
use crate::drivers::osi::ring::{CONTEXT_SLOT_LEN, RxSwcx, SlotContext, SwcxFlags, TxRing};

bitflags! {
	#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
	pub struct PktFlags: u32 {
		const CSUM = 1 << 0;
		const TSO = 1 << 1;
		const VLAN = 1 << 2;
		const PTP = 1 << 3;
	}
}

const VLAN_PRIO_SHIFT: u32 = 13;
const VLAN_PRIO_MASK: u32 = 0x7;

/// Per-frame transmit metadata.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketContext {
	pub flags: PktFlags,
	pub vtag: u16,
	pub mss: u32,
	/// TCP or UDP header length.
	pub l4_hdr_len: usize,
	/// Length of all headers up to and including the transport header.
	pub total_hdr_len: usize,
	pub payload_len: usize,
	pub frame_len: usize,
	/// Slots consumed, context slot included.
	pub desc_cnt: usize,
	/// Slots carrying frame data.
	pub data_desc_cnt: usize,
}

impl PacketContext {
	/// Segmentation and VLAN insertion need a leading context descriptor.
	pub fn has_context_slot(&self) -> bool {
		self.flags.intersects(PktFlags::TSO | PktFlags::VLAN)
	}
}

/// A frame the binder could not place, handed back to its owner.
#[derive(Debug)]
pub struct Rejected {
	pub error: DmaError,
	pub frame: TxFrame,
}

fn packet_context(frame: &mut TxFrame, pool: &dyn BufferPool) -> Result<PacketContext, DmaError> {
	let mut cx = PacketContext {
		frame_len: frame.len(),
		..PacketContext::default()
	};

	if let Some(gso) = frame.gso {
		if frame.header_shared {
			let headlen = frame.headlen();
			pool.unshare(&mut frame.data, headlen).map_err(|err| {
				error!("Unable to handle TSO packet ({err})");
				DmaError::MappingFailed
			})?;
			frame.header_shared = false;
		}

		let (l4_hdr_len, mss) = match gso.kind {
			GsoKind::Udp => (UDP_HDR_LEN, gso.size.saturating_sub(UDP_HDR_LEN as u32)),
			GsoKind::Tcp => (gso.tcp_hdr_len, gso.size),
		};
		cx.flags |= PktFlags::TSO;
		cx.mss = mss;
		cx.l4_hdr_len = l4_hdr_len;
		cx.total_hdr_len = gso.transport_offset + l4_hdr_len;
		cx.payload_len = cx.frame_len.saturating_sub(cx.total_hdr_len);

		debug!("mss           ={}", cx.mss);
		debug!("payload_len   ={}", cx.payload_len);
		debug!("tcp_udp_hdrlen={}", cx.l4_hdr_len);
		debug!("total_hdrlen  ={}", cx.total_hdr_len);
	} else if frame.csum_offload {
		cx.flags |= PktFlags::CSUM;
	}

	if let Some(tci) = frame.vlan_tci {
		let prio = (frame.priority & VLAN_PRIO_MASK) << VLAN_PRIO_SHIFT;
		cx.vtag = tci | prio as u16;
		cx.flags |= PktFlags::VLAN;
	}

	if frame.timestamp {
		cx.flags |= PktFlags::PTP;
	}

	Ok(cx)
}

/// Claims consecutive transmit slots starting at the ring's head.
struct SlotWriter<'a> {
	ring: &'a mut TxRing,
	mapper: &'a dyn DmaMapper,
	max_len: usize,
	idx: usize,
	cnt: usize,
}

impl<'a> SlotWriter<'a> {
	fn new(ring: &'a mut TxRing, mapper: &'a dyn DmaMapper, max_len: usize) -> Self {
		let idx = ring.cur;
		Self {
			ring,
			mapper,
			max_len,
			idx,
			cnt: 0,
		}
	}

	fn free_slot(&self) -> Result<usize, DmaError> {
		if self.ring.swcx[self.idx].is_busy() {
			return Err(DmaError::WouldBlock);
		}
		Ok(self.idx)
	}

	fn advance(&mut self) {
		self.cnt += 1;
		self.idx = self.ring.next(self.idx);
	}

	fn reserve_context(&mut self) -> Result<(), DmaError> {
		let idx = self.free_slot()?;
		self.ring.swcx[idx].len = CONTEXT_SLOT_LEN;
		self.advance();
		Ok(())
	}

	/// Maps `len` bytes of the linear part starting at `offset`.
	fn map_linear(
		&mut self,
		buf: &PacketBuffer,
		mut offset: usize,
		mut len: usize,
	) -> Result<(), DmaError> {
		while len > 0 {
			let idx = self.free_slot()?;
			let size = len.min(self.max_len);
			let dma = self
				.mapper
				.map_single(buf, offset, size, DmaDirection::ToDevice)
				.inspect_err(|err| error!("failed to map Tx buffer: {err}"))?;

			let swcx = &mut self.ring.swcx[idx];
			swcx.dma = dma;
			swcx.flags = SwcxFlags::empty();
			swcx.len = size;
			len -= size;
			offset += size;
			self.advance();
		}
		Ok(())
	}

	fn map_frag(&mut self, frag: &Fragment) -> Result<(), DmaError> {
		let mut offset = 0;
		let mut len = frag.len;
		while len > 0 {
			let idx = self.free_slot()?;
			let size = len.min(self.max_len);
			let dma = self
				.mapper
				.map_page(&frag.page, frag.offset + offset, size, DmaDirection::ToDevice)
				.inspect_err(|err| error!("failed to map Tx buffer: {err}"))?;

			let swcx = &mut self.ring.swcx[idx];
			swcx.dma = dma;
			swcx.flags = SwcxFlags::PAGED;
			swcx.len = size;
			len -= size;
			offset += size;
			self.advance();
		}
		Ok(())
	}

	/// Releases every slot claimed so far, newest first.
	fn unwind(&mut self) {
		while self.cnt > 0 {
			self.idx = self.ring.prev(self.idx);
			self.ring.swcx[self.idx].unmap(self.mapper);
			self.cnt -= 1;
		}
	}

	fn map_frame(&mut self, frame: &TxFrame, cx: &PacketContext) -> Result<(), DmaError> {
		if cx.has_context_slot() {
			self.reserve_context()?;
		}

		let headlen = frame.headlen();
		if cx.flags.contains(PktFlags::TSO) {
			// The headers get a descriptor of their own.
			let hdr_len = cx.total_hdr_len.min(headlen);
			self.map_linear(&frame.data, 0, hdr_len)?;
			self.map_linear(&frame.data, hdr_len, headlen - hdr_len)?;
		} else {
			self.map_linear(&frame.data, 0, headlen)?;
		}

		for frag in &frame.frags {
			self.map_frag(frag)?;
		}

		if self.cnt == usize::from(cx.has_context_slot()) {
			// Nothing to transmit.
			return Err(DmaError::MappingFailed);
		}
		Ok(())
	}
}

/// Claims and maps the slots of `frame` on `ring`.
///
/// `max_len` caps the bytes mapped into a single slot. On success the frame
/// is owned by its last slot and the returned context describes the slots
/// to publish. On failure nothing of the ring is left changed and the frame
/// is handed back: `WouldBlock` when a needed slot is still busy, the
/// mapper's error when mapping failed.
pub fn bind(
	ring: &mut TxRing,
	mut frame: TxFrame,
	max_len: usize,
	mapper: &dyn DmaMapper,
	pool: &dyn BufferPool,
) -> Result<PacketContext, Rejected> {
	let mut cx = match packet_context(&mut frame, pool) {
		Ok(cx) => cx,
		Err(error) => return Err(Rejected { error, frame }),
	};

	let mut writer = SlotWriter::new(ring, mapper, max_len);
	if let Err(error) = writer.map_frame(&frame, &cx) {
		writer.unwind();
		return Err(Rejected { error, frame });
	}

	cx.desc_cnt = writer.cnt;
	cx.data_desc_cnt = writer.cnt - usize::from(cx.has_context_slot());
	let last = writer.ring.prev(writer.idx);
	writer.ring.swcx[last].frame = Some(frame);

	Ok(cx)
}

/// Installs a freshly allocated and mapped receive buffer in `swcx`.
///
/// On failure `swcx` is left untouched; the caller points it at the
/// reserved buffer instead.
pub fn refill(
	swcx: &mut RxSwcx,
	len: usize,
	mapper: &dyn DmaMapper,
	pool: &dyn BufferPool,
) -> Result<(), DmaError> {
	let buf = pool.alloc(len)?;
	let dma = match mapper.map_single(&buf, 0, len, DmaDirection::FromDevice) {
		Ok(dma) => dma,
		Err(err) => {
			pool.release(buf);
			return Err(err);
		}
	};

	swcx.buf = Some(buf);
	swcx.dma = dma;
	swcx.flags = SwcxFlags::empty();
	swcx.len = len;
	Ok(())
}

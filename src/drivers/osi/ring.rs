//! Descriptor rings.
//!
//! A ring pairs the descriptor table the controller walks with a software
//! context per descriptor. The context's `len` doubles as the busy flag of
//! its slot: it is checked before a slot is claimed and cleared last when
//! the slot is released.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::mem;
use core::ptr::NonNull;

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::arch::memory_barrier;
use crate::config::{ConfigError, MIN_DESC_CNT};
use crate::drivers::error::DmaError;
use crate::drivers::osi::binder::{PacketContext, PktFlags};
use crate::drivers::osi::buffer::{BufferPool, PacketBuffer, TxFrame};
use crate::drivers::osi::desc::{
	Descriptor, Rdes3, TDES2_LEN_MASK, TDES2_MSS_MASK, TDES3_FL_MASK, TDES3_THL_MASK,
	TDES3_THL_SHIFT, TDES3_TPL_MASK, TDES3_VT_MASK, Tdes2, Tdes3, Tdes3Ctx,
};
use crate::drivers::osi::dma::{DmaAddr, DmaDirection, DmaMapper};

/// `len` of a transmit slot that carries a context descriptor.
pub const CONTEXT_SLOT_LEN: usize = usize::MAX;

bitflags! {
	#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
	pub struct SwcxFlags: u32 {
		/// Mapped with `map_page` instead of `map_single`.
		const PAGED = 1 << 0;
		/// Points at the shared reserved receive buffer.
		const RESERVED = 1 << 1;
	}
}

pub trait SlotContext: Default {
	fn len(&self) -> usize;

	fn is_busy(&self) -> bool {
		self.len() != 0
	}
}

/// Software context of a transmit slot.
#[derive(Debug, Default)]
pub struct TxSwcx {
	pub(crate) dma: DmaAddr,
	pub(crate) len: usize,
	pub(crate) flags: SwcxFlags,
	/// Set on the last slot of a frame.
	pub(crate) frame: Option<TxFrame>,
}

impl SlotContext for TxSwcx {
	fn len(&self) -> usize {
		self.len
	}
}

impl TxSwcx {
	/// Drops the mapping held by this slot and marks it free.
	pub(crate) fn unmap(&mut self, mapper: &dyn DmaMapper) {
		if self.len != CONTEXT_SLOT_LEN && self.len != 0 {
			if self.flags.contains(SwcxFlags::PAGED) {
				mapper.unmap_page(self.dma, self.len, DmaDirection::ToDevice);
			} else {
				mapper.unmap_single(self.dma, self.len, DmaDirection::ToDevice);
			}
		}
		self.dma = 0;
		self.flags = SwcxFlags::empty();
		self.len = 0;
	}
}

/// Software context of a receive slot.
#[derive(Debug, Default)]
pub struct RxSwcx {
	pub(crate) dma: DmaAddr,
	pub(crate) len: usize,
	pub(crate) flags: SwcxFlags,
	pub(crate) buf: Option<PacketBuffer>,
}

impl SlotContext for RxSwcx {
	fn len(&self) -> usize {
		self.len
	}
}

/// Fallback receive target for slots that could not be refilled.
///
/// Mapped once for the whole channel set; ring slots only borrow its
/// address and never unmap it.
#[derive(Debug)]
pub struct ReservedBuffer {
	buf: PacketBuffer,
	dma: DmaAddr,
	len: usize,
}

impl ReservedBuffer {
	pub fn allocate(
		len: usize,
		mapper: &dyn DmaMapper,
		pool: &dyn BufferPool,
	) -> Result<Self, DmaError> {
		let buf = pool.alloc(len)?;
		match mapper.map_single(&buf, 0, len, DmaDirection::FromDevice) {
			Ok(dma) => Ok(Self { buf, dma, len }),
			Err(err) => {
				pool.release(buf);
				Err(err)
			}
		}
	}

	pub fn free(self, mapper: &dyn DmaMapper, pool: &dyn BufferPool) {
		mapper.unmap_single(self.dma, self.len, DmaDirection::FromDevice);
		pool.release(self.buf);
	}

	pub fn dma(&self) -> DmaAddr {
		self.dma
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	pub(crate) fn install(&self, swcx: &mut RxSwcx) {
		swcx.buf = None;
		swcx.dma = self.dma;
		swcx.flags = SwcxFlags::RESERVED;
		swcx.len = self.len;
	}
}

pub struct Ring<C> {
	pub(crate) desc: Box<[Descriptor]>,
	pub(crate) swcx: Box<[C]>,
	desc_dma: DmaAddr,
	/// Next slot the producer fills.
	pub(crate) cur: usize,
	/// Next slot the consumer reclaims.
	pub(crate) clean: usize,
}

pub type TxRing = Ring<TxSwcx>;
pub type RxRing = Ring<RxSwcx>;

fn try_boxed_slice<T>(len: usize, f: impl FnMut() -> T) -> Result<Box<[T]>, DmaError> {
	let mut vec = Vec::new();
	vec.try_reserve_exact(len)
		.map_err(|_| DmaError::OutOfMemory)?;
	vec.resize_with(len, f);
	Ok(vec.into_boxed_slice())
}

impl<C: SlotContext> Ring<C> {
	/// Allocates a zeroed descriptor table of `size` entries, maps it for
	/// the controller and allocates the zeroed software contexts.
	pub fn allocate(size: usize, mapper: &dyn DmaMapper) -> Result<Self, DmaError> {
		if size < MIN_DESC_CNT || !size.is_power_of_two() {
			return Err(ConfigError::RingSize(size).into());
		}

		let mut desc = try_boxed_slice(size, Descriptor::zeroed)?;
		let swcx = try_boxed_slice(size, C::default)?;
		let cpu = NonNull::from(&mut *desc).cast::<u8>();
		let desc_dma = mapper.map_coherent(cpu, size * mem::size_of::<Descriptor>())?;

		Ok(Self {
			desc,
			swcx,
			desc_dma,
			cur: 0,
			clean: 0,
		})
	}

	pub fn size(&self) -> usize {
		self.desc.len()
	}

	pub fn desc_dma(&self) -> DmaAddr {
		self.desc_dma
	}

	pub fn head(&self) -> usize {
		self.cur
	}

	pub fn tail(&self) -> usize {
		self.clean
	}

	pub(crate) fn next(&self, idx: usize) -> usize {
		(idx + 1) & (self.size() - 1)
	}

	pub(crate) fn prev(&self, idx: usize) -> usize {
		idx.wrapping_sub(1) & (self.size() - 1)
	}

	/// Free descriptors, `(tail - head - 1) mod N`, or zero once the slot
	/// at `head` is still busy.
	pub fn avail(&self) -> usize {
		if self.swcx[self.cur].is_busy() {
			return 0;
		}
		(self.clean + self.size() - self.cur - 1) & (self.size() - 1)
	}

	/// No slot awaits reclaiming.
	pub fn is_empty(&self) -> bool {
		!self.swcx[self.clean].is_busy()
	}

	pub fn slot_len(&self, idx: usize) -> usize {
		self.swcx[idx].len()
	}

	fn release_table(self, mapper: &dyn DmaMapper) {
		mapper.unmap_coherent(self.desc_dma, self.size() * mem::size_of::<Descriptor>());
	}
}

/// A frame reclaimed from a transmit ring.
#[derive(Debug)]
pub struct TxDone {
	pub frame: TxFrame,
	pub timestamp: Option<u64>,
	pub error: bool,
}

impl TxRing {
	/// Writes the descriptors of a bound frame and hands them to the
	/// controller, first descriptor last. Returns the new doorbell index.
	pub(crate) fn publish(&mut self, cx: &PacketContext, ioc: bool) -> usize {
		let first = self.cur;
		let mut idx = first;

		if cx.has_context_slot() {
			let mut tdes2 = 0;
			let mut tdes3 = Tdes3Ctx::CTXT.bits();
			if cx.flags.contains(PktFlags::TSO) {
				tdes2 = cx.mss & TDES2_MSS_MASK;
				tdes3 |= Tdes3Ctx::TCMSSV.bits();
			}
			if cx.flags.contains(PktFlags::VLAN) {
				tdes3 |= Tdes3Ctx::VLTV.bits() | (u32::from(cx.vtag) & TDES3_VT_MASK);
			}
			self.desc[idx].write(0, 0, tdes2, tdes3);
			idx = self.next(idx);
		}

		for n in 0..cx.data_desc_cnt {
			let mut tdes2 = Tdes2::empty();
			let mut tdes3 = Tdes3::empty();
			let mut len3 = 0;

			if n == 0 {
				tdes3 |= Tdes3::FD;
				if cx.flags.contains(PktFlags::TSO) {
					tdes3 |= Tdes3::TSE;
					let thl = (cx.l4_hdr_len as u32 / 4) & TDES3_THL_MASK;
					len3 = (cx.payload_len as u32 & TDES3_TPL_MASK) | (thl << TDES3_THL_SHIFT);
				} else {
					len3 = cx.frame_len as u32 & TDES3_FL_MASK;
					if cx.flags.contains(PktFlags::CSUM) {
						tdes3 |= Tdes3::CIC_FULL;
					}
				}
				if cx.flags.contains(PktFlags::VLAN) {
					tdes2 |= Tdes2::VTIR_INSERT;
				}
				if cx.flags.contains(PktFlags::PTP) {
					tdes2 |= Tdes2::TTSE;
				}
			}

			if n + 1 == cx.data_desc_cnt {
				tdes3 |= Tdes3::LD;
				if ioc || cx.flags.contains(PktFlags::PTP) {
					tdes2 |= Tdes2::IOC;
				}
			}

			let swcx = &self.swcx[idx];
			let des2 = tdes2.bits() | (swcx.len as u32 & TDES2_LEN_MASK);
			self.desc[idx].write_buffer(swcx.dma, des2, tdes3.bits() | len3);
			#[cfg(feature = "desc-trace")]
			trace!("tx desc {idx}: addr {:#x} des2 {des2:#x}", swcx.dma);
			idx = self.next(idx);
		}

		memory_barrier();
		let mut own = self.next(first);
		for _ in 1..cx.desc_cnt {
			self.desc[own].set_own();
			own = self.next(own);
		}
		memory_barrier();
		self.desc[first].set_own();

		self.cur = idx;
		idx
	}

	/// Reclaims up to `budget` frames the controller has finished with.
	pub(crate) fn reclaim(
		&mut self,
		budget: usize,
		mapper: &dyn DmaMapper,
		done: &mut SmallVec<[TxDone; 16]>,
	) -> usize {
		let mut processed = 0;

		while processed < budget {
			let idx = self.clean;
			if !self.swcx[idx].is_busy() || self.desc[idx].owned_by_hw() {
				break;
			}
			memory_barrier();

			let swcx = &mut self.swcx[idx];
			if let Some(frame) = swcx.frame.take() {
				let timestamp = if frame.timestamp {
					self.desc[idx].tx_timestamp()
				} else {
					None
				};
				done.push(TxDone {
					frame,
					timestamp,
					error: self.desc[idx].tx_error(),
				});
				processed += 1;
			}
			swcx.unmap(mapper);
			self.desc[idx].clear();
			#[cfg(feature = "desc-trace")]
			trace!("tx desc {idx}: reclaimed");

			self.clean = self.next(idx);
		}

		processed
	}
}

/// Releases a transmit ring and every frame still bound to it.
///
/// Leaves `None` behind, so calling it again is a no-op.
pub fn free_tx_ring(ring: &mut Option<TxRing>, mapper: &dyn DmaMapper, pool: &dyn BufferPool) {
	let Some(mut ring) = ring.take() else {
		return;
	};

	for swcx in ring.swcx.iter_mut() {
		if let Some(frame) = swcx.frame.take() {
			frame.release(pool);
		}
		swcx.unmap(mapper);
	}

	ring.release_table(mapper);
}

/// A frame taken from a receive ring.
#[derive(Debug)]
pub struct RxDone {
	pub buf: PacketBuffer,
	pub len: usize,
	pub vlan_tci: Option<u16>,
	pub csum_ok: bool,
}

/// Outcome counters of one receive reclaim pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RxReclaim {
	pub processed: usize,
	pub errors: usize,
	pub dropped: usize,
	pub fallbacks: usize,
}

impl RxRing {
	/// Allocates a receive ring with a freshly mapped buffer in every slot,
	/// all owned by the controller.
	pub fn allocate_rx(
		size: usize,
		buf_len: usize,
		mapper: &dyn DmaMapper,
		pool: &dyn BufferPool,
	) -> Result<Self, DmaError> {
		let mut ring = Self::allocate(size, mapper)?;

		for idx in 0..size {
			if let Err(err) = super::binder::refill(&mut ring.swcx[idx], buf_len, mapper, pool) {
				free_rx_ring(&mut Some(ring), mapper, pool);
				return Err(err);
			}
			ring.arm(idx);
		}

		Ok(ring)
	}

	/// Hands the buffer of slot `idx` to the controller.
	fn arm(&mut self, idx: usize) {
		let dma = self.swcx[idx].dma;
		self.desc[idx].write_buffer(dma, 0, (Rdes3::IOC | Rdes3::BUF1V).bits());
		memory_barrier();
		self.desc[idx].set_own();
	}

	/// Delivers up to `budget` received frames into `done`, refilling every
	/// vacated slot before moving on.
	pub(crate) fn reclaim(
		&mut self,
		budget: usize,
		buf_len: usize,
		mapper: &dyn DmaMapper,
		pool: &dyn BufferPool,
		reserved: &ReservedBuffer,
		done: &mut SmallVec<[RxDone; 16]>,
	) -> RxReclaim {
		let mut stats = RxReclaim::default();

		while stats.processed < budget {
			let idx = self.clean;
			if self.desc[idx].owned_by_hw() {
				break;
			}
			memory_barrier();

			let status = self.desc[idx].rx_status();
			let swcx = &mut self.swcx[idx];
			if swcx.flags.contains(SwcxFlags::RESERVED) {
				// Landed in the fallback buffer, nothing to deliver.
				stats.dropped += 1;
				if super::binder::refill(swcx, buf_len, mapper, pool).is_err() {
					stats.fallbacks += 1;
					reserved.install(swcx);
				}
			} else if status.error {
				stats.errors += 1;
			} else if let Some(buf) = swcx.buf.take() {
				mapper.unmap_single(swcx.dma, swcx.len, DmaDirection::FromDevice);
				done.push(RxDone {
					buf,
					len: status.len,
					vlan_tci: status.vlan_tci,
					csum_ok: status.csum_ok,
				});
				if super::binder::refill(swcx, buf_len, mapper, pool).is_err() {
					stats.fallbacks += 1;
					reserved.install(swcx);
				}
			}

			self.arm(idx);
			self.clean = self.next(idx);
			stats.processed += 1;
		}

		stats
	}
}

/// Releases a receive ring and the buffers it owns. Slots pointing at the
/// reserved buffer are skipped.
///
/// Leaves `None` behind, so calling it again is a no-op.
pub fn free_rx_ring(ring: &mut Option<RxRing>, mapper: &dyn DmaMapper, pool: &dyn BufferPool) {
	let Some(mut ring) = ring.take() else {
		return;
	};

	for swcx in ring.swcx.iter_mut() {
		let swcx = mem::take(swcx);
		if swcx.flags.contains(SwcxFlags::RESERVED) {
			continue;
		}
		if let Some(buf) = swcx.buf {
			mapper.unmap_single(swcx.dma, swcx.len, DmaDirection::FromDevice);
			pool.release(buf);
		}
	}

	ring.release_table(mapper);
}

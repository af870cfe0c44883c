//! Layout of the EQOS/MGBE DMA descriptors.
//!
//! Transmit and receive descriptors share one 16-byte format. Software
//! writes the "read" view, the controller overwrites it with the
//! "write-back" view once it clears OWN.

use bitflags::bitflags;
use volatile::{VolatileFieldAccess, VolatileRef};

use crate::drivers::osi::dma::DmaAddr;

#[derive(VolatileFieldAccess, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct Descriptor {
	des0: u32,
	des1: u32,
	des2: u32,
	des3: u32,
}

bitflags! {
	/// TDES2 of a normal transmit descriptor.
	#[derive(Clone, Copy, Debug, PartialEq, Eq)]
	pub struct Tdes2: u32 {
		const IOC = 1 << 31;
		const TTSE = 1 << 30;
		/// VLAN tag insertion from the context descriptor.
		const VTIR_INSERT = 2 << 14;
	}

	/// TDES3 of a normal transmit descriptor, read format.
	#[derive(Clone, Copy, Debug, PartialEq, Eq)]
	pub struct Tdes3: u32 {
		const OWN = 1 << 31;
		const CTXT = 1 << 30;
		const FD = 1 << 29;
		const LD = 1 << 28;
		const TSE = 1 << 18;
		/// Insert IP header and full pseudo-header checksums.
		const CIC_FULL = 3 << 16;
	}

	/// TDES3 of a transmit descriptor, write-back format.
	#[derive(Clone, Copy, Debug, PartialEq, Eq)]
	pub struct Tdes3Wb: u32 {
		const OWN = 1 << 31;
		const CTXT = 1 << 30;
		const FD = 1 << 29;
		const LD = 1 << 28;
		const TTSS = 1 << 17;
		const ES = 1 << 15;
	}

	/// TDES3 of a context descriptor.
	#[derive(Clone, Copy, Debug, PartialEq, Eq)]
	pub struct Tdes3Ctx: u32 {
		const OWN = 1 << 31;
		const CTXT = 1 << 30;
		const TCMSSV = 1 << 26;
		const VLTV = 1 << 16;
	}

	/// RDES3, read format.
	#[derive(Clone, Copy, Debug, PartialEq, Eq)]
	pub struct Rdes3: u32 {
		const OWN = 1 << 31;
		const IOC = 1 << 30;
		const BUF1V = 1 << 24;
	}

	/// RDES3, write-back format.
	#[derive(Clone, Copy, Debug, PartialEq, Eq)]
	pub struct Rdes3Wb: u32 {
		const OWN = 1 << 31;
		const CTXT = 1 << 30;
		const FD = 1 << 29;
		const LD = 1 << 28;
		const RS1V = 1 << 26;
		const RS0V = 1 << 25;
		const ES = 1 << 15;
	}

	/// RDES1, write-back format.
	#[derive(Clone, Copy, Debug, PartialEq, Eq)]
	pub struct Rdes1Wb: u32 {
		const IPCE = 1 << 7;
		const IPHE = 1 << 3;
	}
}

pub const TDES2_LEN_MASK: u32 = 0x3FFF;
pub const TDES2_MSS_MASK: u32 = 0x3FFF;
pub const TDES3_FL_MASK: u32 = 0x7FFF;
pub const TDES3_TPL_MASK: u32 = 0x3_FFFF;
pub const TDES3_THL_SHIFT: u32 = 19;
pub const TDES3_THL_MASK: u32 = 0xF;
pub const TDES3_VT_MASK: u32 = 0xFFFF;
pub const RDES3_PL_MASK: u32 = 0x7FFF;
pub const RDES0_VT_MASK: u32 = 0xFFFF;

const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Status decoded from a receive write-back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RxStatus {
	pub len: usize,
	pub vlan_tci: Option<u16>,
	pub csum_ok: bool,
	/// Error summary set, or the frame did not fit a single buffer.
	pub error: bool,
}

impl Descriptor {
	pub const fn zeroed() -> Self {
		Self {
			des0: 0,
			des1: 0,
			des2: 0,
			des3: 0,
		}
	}

	/// Writes all four words. OWN in `des3` must not be set by the caller;
	/// hardware ownership is granted with [`set_own`](Self::set_own).
	pub fn write(&mut self, des0: u32, des1: u32, des2: u32, des3: u32) {
		let mut desc = VolatileRef::from_mut_ref(self);
		let desc = desc.as_mut_ptr();
		desc.des0().write(des0);
		desc.des1().write(des1);
		desc.des2().write(des2);
		desc.des3().write(des3);
	}

	/// Writes a buffer address and its control words.
	pub fn write_buffer(&mut self, addr: DmaAddr, des2: u32, des3: u32) {
		self.write(addr as u32, (addr >> 32) as u32, des2, des3);
	}

	pub fn clear(&mut self) {
		self.write(0, 0, 0, 0);
	}

	pub fn des0(&self) -> u32 {
		VolatileRef::from_ref(self).as_ptr().des0().read()
	}

	pub fn des1(&self) -> u32 {
		VolatileRef::from_ref(self).as_ptr().des1().read()
	}

	pub fn des2(&self) -> u32 {
		VolatileRef::from_ref(self).as_ptr().des2().read()
	}

	pub fn des3(&self) -> u32 {
		VolatileRef::from_ref(self).as_ptr().des3().read()
	}

	pub fn owned_by_hw(&self) -> bool {
		self.des3() & Tdes3::OWN.bits() != 0
	}

	/// Hands the descriptor to the controller.
	pub fn set_own(&mut self) {
		let mut desc = VolatileRef::from_mut_ref(self);
		desc.as_mut_ptr().des3().update(|des3| des3 | Tdes3::OWN.bits());
	}

	/// Transmit timestamp of a completed last descriptor, in nanoseconds.
	pub fn tx_timestamp(&self) -> Option<u64> {
		let des3 = Tdes3Wb::from_bits_retain(self.des3());
		if !des3.contains(Tdes3Wb::LD | Tdes3Wb::TTSS) {
			return None;
		}

		let nsec = u64::from(self.des0());
		let sec = u64::from(self.des1());
		Some(sec * NSEC_PER_SEC + nsec)
	}

	pub fn tx_error(&self) -> bool {
		Tdes3Wb::from_bits_retain(self.des3()).contains(Tdes3Wb::ES)
	}

	/// Decodes a receive write-back.
	pub fn rx_status(&self) -> RxStatus {
		let des3 = Rdes3Wb::from_bits_retain(self.des3());
		let des1 = Rdes1Wb::from_bits_retain(self.des1());

		let vlan_tci = des3
			.contains(Rdes3Wb::RS0V)
			.then(|| (self.des0() & RDES0_VT_MASK) as u16)
			.filter(|&tci| tci != 0);
		let csum_ok =
			des3.contains(Rdes3Wb::RS1V) && !des1.intersects(Rdes1Wb::IPCE | Rdes1Wb::IPHE);

		RxStatus {
			len: (self.des3() & RDES3_PL_MASK) as usize,
			vlan_tci,
			csum_ok,
			error: des3.contains(Rdes3Wb::ES) || !des3.contains(Rdes3Wb::FD | Rdes3Wb::LD),
		}
	}
}

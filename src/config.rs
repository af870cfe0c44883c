//! Hardware constants and the channel-set configuration.

use align_address::Align;
use smallvec::SmallVec;
use thiserror::Error;

/// Default number of transmit descriptors per channel.
pub const TX_DESC_CNT: usize = 256;
/// Default number of receive descriptors per channel.
pub const RX_DESC_CNT: usize = 256;
pub const MIN_DESC_CNT: usize = 4;

/// Largest buffer a single transmit descriptor can describe (TDES2.B1L).
pub const TX_MAX_BUFF_SIZE: usize = 0x3FFF;
pub const MAX_SKB_FRAGS: usize = 17;
/// Descriptors a 64 KiB segmentation payload splits into.
pub const TX_MAX_SPLIT: usize = 0x0001_0000 / TX_MAX_BUFF_SIZE + 1;
/// Free descriptors a worst-case frame needs; below this the queue is stopped.
pub const TX_DESC_THRESHOLD: usize = MAX_SKB_FRAGS + TX_MAX_SPLIT + 2;
pub const TX_MAX_FRAME: u32 = (TX_DESC_CNT / TX_DESC_THRESHOLD) as u32;

pub const MAX_CHANS: usize = 10;
pub const EQOS_MAX_CHANS: usize = 4;
pub const MGBE_MAX_CHANS: usize = 10;
pub const MAX_VM_IRQS: usize = 5;
/// Marks an unused entry of the channel table.
pub const INVALID_CHAN: u32 = 0xFF;

pub const EQOS_MAC_4_10: u32 = 0x41;
pub const EQOS_MAC_5_00: u32 = 0x50;
pub const EQOS_MAC_5_30: u32 = 0x53;
pub const MGBE_MAC_3_10: u32 = 0x31;

pub const ETH_HLEN: usize = 14;
pub const ETH_FCS_LEN: usize = 4;
pub const VLAN_HLEN: usize = 4;
pub const ETH_MIN_MTU: usize = 68;
pub const DFLT_MTU: usize = 1500;
pub const MTU_SIZE_9000: usize = 9000;
pub const MAX_MTU: usize = 16383;
pub const DEFAULT_RX_BUF_LEN: usize = 1536;
pub const AXI_BURST_LEN: usize = 64;

pub const NAPI_WEIGHT: usize = 64;

pub const MIN_TX_COALESCE_USEC: u32 = 32;
pub const MAX_TX_COALESCE_USEC: u32 = 1020;
pub const MIN_TX_COALESCE_FRAMES: u32 = 1;
pub const MIN_RX_COALESCE_USEC: u32 = 3;
pub const MAX_RX_COALESCE_USEC: u32 = 1020;
pub const MIN_RX_COALESCE_FRAMES: u32 = 1;

pub const MAX_QUEUE_PRIO: u32 = 7;
pub const DEFAULT_QUEUE_PRIO: u32 = 0;

/// Receive buffer length for frames of `mtu` bytes payload.
pub fn rx_buf_len(mtu: usize) -> usize {
	if mtu <= DFLT_MTU {
		return DEFAULT_RX_BUF_LEN;
	}

	(mtu + ETH_HLEN + ETH_FCS_LEN + VLAN_HLEN).align_up(AXI_BURST_LEN)
}

/// MAC generation, selects the channel limit and the interrupt layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MacType {
	Eqos,
	Mgbe,
}

impl MacType {
	pub const fn max_chans(self) -> usize {
		match self {
			MacType::Eqos => EQOS_MAX_CHANS,
			MacType::Mgbe => MGBE_MAX_CHANS,
		}
	}
}

/// How data-path interrupts reach the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqTopology {
	/// One transmit and one receive line per channel.
	PerChannel,
	/// A few lines, each shared by a group of channels.
	VmShared,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChanIrqs {
	pub tx: u32,
	pub rx: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmIrq {
	pub irq: u32,
	pub chans: SmallVec<[u32; MAX_CHANS]>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IrqConfig {
	pub common: u32,
	/// Per-channel lines, in the order of [`DmaConfig::dma_chans`].
	pub chan: SmallVec<[ChanIrqs; MAX_CHANS]>,
	pub vm: SmallVec<[VmIrq; MAX_VM_IRQS]>,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
	#[error("{count} DMA channels configured, hardware supports 1 to {max}")]
	ChannelCount { count: usize, max: usize },
	#[error("DMA channel {0} is out of range")]
	ChannelNumber(u32),
	#[error("DMA channel {0} is listed twice")]
	DuplicateChannel(u32),
	#[error("{queues} MTL queues configured for {chans} DMA channels")]
	QueueCount { queues: usize, chans: usize },
	#[error("ring size {0} is not a power of two of at least {MIN_DESC_CNT}")]
	RingSize(usize),
	#[error("low-water mark {low_water} does not fit a ring of {size} descriptors")]
	LowWater { low_water: usize, size: usize },
	#[error("per-descriptor buffer limit {0} is out of range")]
	MaxBufLen(usize),
	#[error("poll weight must be non-zero")]
	NapiWeight,
	#[error("MTU {0} is out of range")]
	Mtu(usize),
	#[error("MTU {0} requires a single DMA channel")]
	JumboMultiChannel(usize),
	#[error("tx_usecs {0} is out of range")]
	TxUsecs(u32),
	#[error("tx_frames {0} is out of range")]
	TxFrames(u32),
	#[error("tx_frames coalescing requires tx_usecs")]
	TxFramesWithoutUsecs,
	#[error("rx_riwt {0} is out of range")]
	RxRiwt(u32),
	#[error("rx_frames {0} is out of range")]
	RxFrames(u32),
	#[error("rx_frames coalescing requires rx_riwt")]
	RxFramesWithoutRiwt,
	#[error("interrupt lines missing for DMA channel {0}")]
	ChannelIrqs(u32),
	#[error("invalid VM interrupt layout")]
	VmIrqs,
}

/// Configuration of one channel set, handed to [`Engine::new`](crate::Engine::new).
#[derive(Clone, Debug)]
pub struct DmaConfig {
	pub mac: MacType,
	pub mac_ver: u32,
	/// Hardware DMA channel numbers, one per transmit queue.
	pub dma_chans: SmallVec<[u32; MAX_CHANS]>,
	/// MTL queue numbers, in transmit queue order.
	pub mtl_queues: SmallVec<[u32; MAX_CHANS]>,
	/// Priority served by each MTL queue, indexed by MTL queue number.
	pub queue_prio: [u32; MAX_CHANS],
	pub tx_ring_size: usize,
	pub rx_ring_size: usize,
	/// Largest chunk mapped into a single transmit descriptor.
	pub tx_max_buf_len: usize,
	/// Free-descriptor count at which the transmit queue is stopped.
	pub tx_low_water: usize,
	pub napi_weight: usize,
	pub mtu: usize,
	pub tx_usecs: Option<u32>,
	pub tx_frames: Option<u32>,
	pub rx_riwt: Option<u32>,
	pub rx_frames: Option<u32>,
	pub tx_fifo_size: u32,
	pub rx_fifo_size: u32,
	pub irqs: IrqConfig,
}

impl DmaConfig {
	/// Single-channel defaults for the given MAC.
	pub fn new(mac: MacType, mac_ver: u32) -> Self {
		Self {
			mac,
			mac_ver,
			dma_chans: SmallVec::from_slice(&[0]),
			mtl_queues: SmallVec::from_slice(&[0]),
			queue_prio: [DEFAULT_QUEUE_PRIO; MAX_CHANS],
			tx_ring_size: TX_DESC_CNT,
			rx_ring_size: RX_DESC_CNT,
			tx_max_buf_len: TX_MAX_BUFF_SIZE,
			tx_low_water: TX_DESC_THRESHOLD,
			napi_weight: NAPI_WEIGHT,
			mtu: DFLT_MTU,
			tx_usecs: None,
			tx_frames: None,
			rx_riwt: None,
			rx_frames: None,
			tx_fifo_size: 0,
			rx_fifo_size: 0,
			irqs: IrqConfig::default(),
		}
	}

	pub fn irq_topology(&self) -> IrqTopology {
		if self.mac == MacType::Mgbe || self.mac_ver > EQOS_MAC_5_00 {
			IrqTopology::VmShared
		} else {
			IrqTopology::PerChannel
		}
	}

	pub fn num_chans(&self) -> usize {
		self.dma_chans.len()
	}

	/// Receive buffer length needed for the configured MTU.
	pub fn rx_buf_len(&self) -> usize {
		rx_buf_len(self.mtu)
	}

	/// Channel table padded to the hardware maximum with [`INVALID_CHAN`].
	pub fn chan_table(&self) -> [u32; MAX_CHANS] {
		let mut table = [INVALID_CHAN; MAX_CHANS];
		for (slot, chan) in table.iter_mut().zip(self.dma_chans.iter()) {
			*slot = *chan;
		}
		table
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		let max = self.mac.max_chans();
		let count = self.dma_chans.len();
		if count == 0 || count > max {
			return Err(ConfigError::ChannelCount { count, max });
		}

		let mut seen = 0u32;
		for &chan in &self.dma_chans {
			if chan as usize >= max {
				return Err(ConfigError::ChannelNumber(chan));
			}
			if seen & (1 << chan) != 0 {
				return Err(ConfigError::DuplicateChannel(chan));
			}
			seen |= 1 << chan;
		}

		if self.mtl_queues.len() != count || self.mtl_queues.iter().any(|&q| q as usize >= max) {
			return Err(ConfigError::QueueCount {
				queues: self.mtl_queues.len(),
				chans: count,
			});
		}

		for size in [self.tx_ring_size, self.rx_ring_size] {
			if size < MIN_DESC_CNT || !size.is_power_of_two() {
				return Err(ConfigError::RingSize(size));
			}
		}

		if self.tx_low_water >= self.tx_ring_size {
			return Err(ConfigError::LowWater {
				low_water: self.tx_low_water,
				size: self.tx_ring_size,
			});
		}

		if self.tx_max_buf_len == 0 || self.tx_max_buf_len > TX_MAX_BUFF_SIZE {
			return Err(ConfigError::MaxBufLen(self.tx_max_buf_len));
		}

		if self.napi_weight == 0 {
			return Err(ConfigError::NapiWeight);
		}

		self.validate_mtu(self.mtu)?;
		self.validate_coalescing()?;
		self.validate_irqs()
	}

	pub(crate) fn validate_mtu(&self, mtu: usize) -> Result<(), ConfigError> {
		if !(ETH_MIN_MTU..=MAX_MTU).contains(&mtu) {
			return Err(ConfigError::Mtu(mtu));
		}

		if mtu > MTU_SIZE_9000 && self.dma_chans.len() != 1 {
			return Err(ConfigError::JumboMultiChannel(mtu));
		}

		Ok(())
	}

	fn validate_coalescing(&self) -> Result<(), ConfigError> {
		let tx_usecs_range = MIN_TX_COALESCE_USEC..=MAX_TX_COALESCE_USEC;
		if let Some(usecs) = self.tx_usecs.filter(|u| !tx_usecs_range.contains(u)) {
			return Err(ConfigError::TxUsecs(usecs));
		}

		if let Some(frames) = self.tx_frames {
			if self.tx_usecs.is_none() {
				return Err(ConfigError::TxFramesWithoutUsecs);
			}
			if !(MIN_TX_COALESCE_FRAMES..=TX_MAX_FRAME).contains(&frames) {
				return Err(ConfigError::TxFrames(frames));
			}
		}

		let rx_riwt_range = MIN_RX_COALESCE_USEC..=MAX_RX_COALESCE_USEC;
		if let Some(riwt) = self.rx_riwt.filter(|r| !rx_riwt_range.contains(r)) {
			return Err(ConfigError::RxRiwt(riwt));
		}

		if let Some(frames) = self.rx_frames {
			if self.rx_riwt.is_none() {
				return Err(ConfigError::RxFramesWithoutRiwt);
			}
			if frames < MIN_RX_COALESCE_FRAMES || frames as usize > self.rx_ring_size {
				return Err(ConfigError::RxFrames(frames));
			}
		}

		Ok(())
	}

	fn validate_irqs(&self) -> Result<(), ConfigError> {
		match self.irq_topology() {
			IrqTopology::PerChannel => {
				if let Some(&chan) = self.dma_chans.get(self.irqs.chan.len()) {
					return Err(ConfigError::ChannelIrqs(chan));
				}
			}
			IrqTopology::VmShared => {
				let vm = &self.irqs.vm;
				if vm.is_empty() || vm.len() > MAX_VM_IRQS {
					return Err(ConfigError::VmIrqs);
				}
				let foreign = vm
					.iter()
					.flat_map(|line| line.chans.iter())
					.any(|chan| !self.dma_chans.contains(chan));
				if foreign {
					return Err(ConfigError::VmIrqs);
				}
			}
		}

		Ok(())
	}

	/// Replaces duplicate or out-of-range queue priorities with the default.
	pub(crate) fn normalize_queue_prio(&mut self) {
		let mut pmask = 0u32;
		for &mtlq in &self.mtl_queues {
			let prio = self.queue_prio[mtlq as usize];
			if prio > MAX_QUEUE_PRIO || pmask & (1 << prio) != 0 {
				error!("Wrong or duplicate priority {prio} for Q({mtlq}), using default");
				self.queue_prio[mtlq as usize] = DEFAULT_QUEUE_PRIO;
				continue;
			}
			pmask |= 1 << prio;
		}
	}
}

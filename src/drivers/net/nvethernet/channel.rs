//! Per-channel state: the two rings, their poll tasks and counters.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crossbeam_utils::atomic::AtomicCell;
use hermit_sync::{InterruptSpinMutex, InterruptTicketMutex};

use super::ChanState;
use super::napi::PollTasks;
use super::timer::TxTimer;
use crate::drivers::error::HwError;
use crate::drivers::osi::ring::{RxRing, TxRing};
use crate::drivers::osi::{Direction, DmaHw};

macro_rules! chan_stats {
	($($(#[$attr:meta])* $name:ident),+ $(,)?) => {
		#[derive(Debug, Default)]
		pub(crate) struct ChanStats {
			$(pub $name: AtomicU64,)+
		}

		/// Counters of one DMA channel.
		#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
		pub struct ChanStatsSnapshot {
			$($(#[$attr])* pub $name: u64,)+
		}

		impl ChanStats {
			pub fn snapshot(&self) -> ChanStatsSnapshot {
				ChanStatsSnapshot {
					$($name: self.$name.load(Ordering::Relaxed),)+
				}
			}

			pub fn reset(&self) {
				$(self.$name.store(0, Ordering::Relaxed);)+
			}
		}
	};
}

chan_stats! {
	tx_normal_irq_n,
	rx_normal_irq_n,
	/// Coalescing timer expiries.
	tx_usecs_swtimer_n,
	tx_poll_n,
	rx_poll_n,
	tx_pkt_n,
	tx_err_n,
	/// Transmit attempts rejected because the ring was full.
	tx_ring_full_n,
	/// Frames rejected by the binder for any other reason.
	tx_drop_n,
	rx_pkt_n,
	rx_err_n,
	/// Frames received into the reserved buffer.
	rx_drop_n,
	/// Refills that fell back to the reserved buffer.
	rx_buf_fallback_n,
}

/// Adds `n` to a counter, wrapping at the type's limit.
#[inline]
pub(crate) fn update_stats_counter(counter: &AtomicU64, n: u64) {
	counter.fetch_add(n, Ordering::Relaxed);
}

pub(crate) struct Channel {
	/// Hardware DMA channel number.
	pub chan: u32,
	/// Transmit queue served by this channel.
	pub queue: usize,
	pub state: AtomicCell<ChanState>,
	pub tx: InterruptTicketMutex<Option<TxRing>>,
	pub rx: InterruptTicketMutex<Option<RxRing>>,
	/// Serializes masking and unmasking of both interrupt sources.
	intr: InterruptSpinMutex<()>,
	pub napi: PollTasks,
	pub timer: TxTimer,
	pub queue_stopped: AtomicBool,
	/// Frames published since the last completion interrupt request.
	pub tx_frame_cnt: AtomicU32,
	pub stats: ChanStats,
}

impl Channel {
	pub fn new(chan: u32, queue: usize) -> Self {
		Self {
			chan,
			queue,
			state: AtomicCell::new(ChanState::Down),
			tx: InterruptTicketMutex::new(None),
			rx: InterruptTicketMutex::new(None),
			intr: InterruptSpinMutex::new(()),
			napi: PollTasks::new(),
			timer: TxTimer::new(),
			queue_stopped: AtomicBool::new(false),
			tx_frame_cnt: AtomicU32::new(0),
			stats: ChanStats::default(),
		}
	}

	pub fn set_interrupt(&self, hw: &dyn DmaHw, dir: Direction, enable: bool) {
		let _guard = self.intr.lock();
		if let Err(err) = hw.set_dma_interrupt(self.chan, dir, enable) {
			error!(
				"Failed to {} {dir:?} interrupt of DMA channel {}: {err}",
				if enable { "enable" } else { "disable" },
				self.chan
			);
		}
	}

	/// Unmasks both sources, stopping at the first failure.
	pub fn enable_interrupts(&self, hw: &dyn DmaHw) -> Result<(), HwError> {
		let _guard = self.intr.lock();
		hw.set_dma_interrupt(self.chan, Direction::Tx, true)?;
		hw.set_dma_interrupt(self.chan, Direction::Rx, true)
	}

	pub fn disable_interrupts(&self, hw: &dyn DmaHw) {
		self.set_interrupt(hw, Direction::Tx, false);
		self.set_interrupt(hw, Direction::Rx, false);
	}

	pub fn irq_counter(&self, dir: Direction) -> &AtomicU64 {
		match dir {
			Direction::Tx => &self.stats.tx_normal_irq_n,
			Direction::Rx => &self.stats.rx_normal_irq_n,
		}
	}
}

//! DMA engine of the nvethernet controller.
//!
//! The [`Engine`] owns the rings of every configured DMA channel. It brings
//! the channel set up and down, feeds transmit frames into the rings and
//! runs the poll tasks that the interrupt handlers and coalescing timers
//! post to it.

mod channel;
mod irq;
mod napi;
mod timer;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use core::time::Duration;

use hermit_sync::{InterruptSpinMutex, InterruptTicketMutex, SpinMutex};
use smallvec::SmallVec;

pub use self::channel::ChanStatsSnapshot;
use self::channel::{Channel, update_stats_counter};
pub use self::irq::{IrqKind, IrqLine, IrqReturn, PendingBits};
use self::irq::{IrqLines, irq_lines, vm_chan_mask};
use crate::config::{self, DmaConfig, INVALID_CHAN, IrqTopology, MAX_CHANS, MAX_VM_IRQS};
use crate::drivers::error::{DmaError, HwError};
use crate::drivers::net::NetStack;
use crate::drivers::osi::binder::{self, Rejected};
use crate::drivers::osi::buffer::{BufferPool, TxFrame};
use crate::drivers::osi::dma::DmaMapper;
use crate::drivers::osi::ring::{
	ReservedBuffer, RxReclaim, RxRing, TxDone, TxRing, free_rx_ring, free_tx_ring,
};
use crate::drivers::osi::{ChanSetup, Direction, DmaHw, DmaSetup};

/// Lifecycle state of the channel set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChanState {
	Down,
	/// Rings allocated, hardware not started.
	Initialized,
	Running,
	/// Rings released, register state saved.
	Suspended,
}

/// Scheduling, timer and interrupt services of the platform.
pub trait Runtime: Send + Sync {
	/// Wakes the worker that calls [`Engine::run_pending`].
	fn kick_poller(&self);

	/// Starts the one-shot coalescing timer of `chan`. On expiry the
	/// platform calls [`Engine::tx_timer_expired`].
	fn start_tx_timer(&self, chan: u32, delay: Duration);

	/// Stops the timer of `chan` if it is running. Must not return while
	/// its expiry callback is still running.
	fn cancel_tx_timer(&self, chan: u32);

	/// Routes `line` to [`Engine::handle_irq`].
	fn request_irq(&self, line: &IrqLine) -> Result<(), DmaError>;

	/// Unroutes `line`, waiting for a running handler to return.
	fn free_irq(&self, line: &IrqLine);
}

pub struct Engine {
	cfg: DmaConfig,
	hw: Box<dyn DmaHw>,
	mapper: Box<dyn DmaMapper>,
	pool: Box<dyn BufferPool>,
	runtime: Box<dyn Runtime>,
	stack: Box<dyn NetStack>,
	/// Indexed by transmit queue.
	channels: Vec<Channel>,
	irq_lines: IrqLines,
	/// Bit `i` set while `irq_lines[i]` is registered.
	irq_alloc: InterruptSpinMutex<u32>,
	vm_masks: SmallVec<[u32; MAX_VM_IRQS]>,
	/// Serializes the read-mask-decode sequence of the VM lines.
	vm_status_lock: SpinMutex<()>,
	/// Posted poll tasks, bit `2 * chan + direction`.
	pending: AtomicU32,
	reserved: InterruptTicketMutex<Option<ReservedBuffer>>,
	mtu: AtomicUsize,
	rx_buf_len: AtomicUsize,
	lifecycle: InterruptTicketMutex<()>,
}

impl Engine {
	pub fn new(
		mut cfg: DmaConfig,
		hw: Box<dyn DmaHw>,
		mapper: Box<dyn DmaMapper>,
		pool: Box<dyn BufferPool>,
		runtime: Box<dyn Runtime>,
		stack: Box<dyn NetStack>,
	) -> Result<Self, DmaError> {
		cfg.validate()?;
		cfg.normalize_queue_prio();

		let channels = cfg
			.chan_table()
			.iter()
			.take_while(|&&chan| chan != INVALID_CHAN)
			.enumerate()
			.map(|(queue, &chan)| Channel::new(chan, queue))
			.collect();

		let vm_masks = match cfg.irq_topology() {
			IrqTopology::VmShared => cfg
				.irqs
				.vm
				.iter()
				.map(|vm| vm_chan_mask(&vm.chans))
				.collect(),
			IrqTopology::PerChannel => SmallVec::new(),
		};

		Ok(Self {
			irq_lines: irq_lines(&cfg),
			mtu: AtomicUsize::new(cfg.mtu),
			rx_buf_len: AtomicUsize::new(cfg.rx_buf_len()),
			cfg,
			hw,
			mapper,
			pool,
			runtime,
			stack,
			channels,
			irq_alloc: InterruptSpinMutex::new(0),
			vm_masks,
			vm_status_lock: SpinMutex::new(()),
			pending: AtomicU32::new(0),
			reserved: InterruptTicketMutex::new(None),
			lifecycle: InterruptTicketMutex::new(()),
		})
	}

	pub fn config(&self) -> &DmaConfig {
		&self.cfg
	}

	pub fn state(&self) -> ChanState {
		self.channels[0].state.load()
	}

	/// Lines the platform routes to [`handle_irq`](Self::handle_irq).
	pub fn irq_lines(&self) -> &[IrqLine] {
		&self.irq_lines
	}

	pub fn num_queues(&self) -> usize {
		self.channels.len()
	}

	pub fn mtu(&self) -> usize {
		self.mtu.load(Ordering::Relaxed)
	}

	pub fn rx_buf_len(&self) -> usize {
		self.rx_buf_len.load(Ordering::Relaxed)
	}

	fn channel(&self, chan: u32) -> Option<&Channel> {
		self.channels.iter().find(|ch| ch.chan == chan)
	}

	fn queue(&self, queue: usize) -> Result<&Channel, DmaError> {
		self.channels
			.get(queue)
			.ok_or(DmaError::InvalidChannel(queue as u32))
	}

	fn set_state(&self, state: ChanState) {
		for ch in &self.channels {
			ch.state.store(state);
		}
	}

	fn expect_state(&self, expected: ChanState) -> Result<(), DmaError> {
		let found = self.state();
		if found != expected {
			return Err(DmaError::InvalidState { expected, found });
		}
		Ok(())
	}

	/// Free transmit descriptors of `queue`.
	pub fn avail(&self, queue: usize) -> Result<usize, DmaError> {
		let ch = self.queue(queue)?;
		let ring = ch.tx.lock();
		Ok(ring.as_ref().map_or(0, TxRing::avail))
	}

	pub fn stats(&self, queue: usize) -> Result<ChanStatsSnapshot, DmaError> {
		Ok(self.queue(queue)?.stats.snapshot())
	}

	/// Picks the transmit queue whose MTL queue serves the frame's
	/// priority. A VLAN tag's PCP overrides the frame priority.
	pub fn select_queue(&self, frame: &TxFrame) -> usize {
		let prio = match frame.vlan_tci {
			Some(tci) => u32::from(tci >> 13),
			None => frame.priority,
		};

		self.cfg
			.mtl_queues
			.iter()
			.position(|&mtlq| self.cfg.queue_prio[mtlq as usize] == prio)
			.unwrap_or(0)
	}

	/// Changes the MTU used by the next [`open`](Self::open).
	pub fn set_mtu(&self, mtu: usize) -> Result<(), DmaError> {
		let _lifecycle = self.lifecycle.lock();
		if self.state() != ChanState::Down {
			error!("Interface must be down to change MTU");
			return Err(DmaError::Busy);
		}

		self.cfg.validate_mtu(mtu)?;
		self.mtu.store(mtu, Ordering::Relaxed);
		self.rx_buf_len
			.store(config::rx_buf_len(mtu), Ordering::Relaxed);
		info!("changed MTU to {mtu}");
		Ok(())
	}

	/// Allocates the rings, starts the controller and opens the transmit
	/// queues. Any failure leaves the channel set down.
	pub fn open(&self) -> Result<(), DmaError> {
		let _lifecycle = self.lifecycle.lock();
		self.expect_state(ChanState::Down)?;

		let rx_buf_len = config::rx_buf_len(self.mtu());
		self.rx_buf_len.store(rx_buf_len, Ordering::Relaxed);

		self.allocate_dma_resources(rx_buf_len)
			.inspect_err(|err| error!("failed to allocate DMA resources: {err}"))?;
		self.set_state(ChanState::Initialized);

		if let Err(err) = self.bring_up(rx_buf_len, true) {
			self.free_dma_resources();
			self.set_state(ChanState::Down);
			return Err(err);
		}

		self.wake_queues();
		self.set_state(ChanState::Running);
		self.print_information();
		Ok(())
	}

	/// Stops the controller and releases every DMA resource. Closing a
	/// channel set that is down does nothing.
	pub fn close(&self) {
		let _lifecycle = self.lifecycle.lock();
		let state = self.state();
		if state == ChanState::Down {
			return;
		}

		self.stop_queues();
		self.free_irqs();
		if state != ChanState::Suspended {
			self.quiesce();
		}
		self.free_dma_resources();

		for ch in &self.channels {
			ch.stats.reset();
			ch.tx_frame_cnt.store(0, Ordering::Relaxed);
		}
		self.set_state(ChanState::Down);
	}

	/// Saves the register state and releases the rings. Interrupt lines and
	/// the reserved buffer are kept for [`resume`](Self::resume).
	pub fn suspend(&self) -> Result<(), DmaError> {
		let _lifecycle = self.lifecycle.lock();
		self.expect_state(ChanState::Running)?;

		self.hw
			.save_registers()
			.inspect_err(|err| error!("failed to save registers: {err}"))?;

		self.stop_queues();
		self.quiesce();
		self.set_state(ChanState::Suspended);
		Ok(())
	}

	/// Reallocates the rings and restarts the controller. On failure the
	/// channel set stays suspended.
	pub fn resume(&self) -> Result<(), DmaError> {
		let _lifecycle = self.lifecycle.lock();
		self.expect_state(ChanState::Suspended)?;

		let rx_buf_len = self.rx_buf_len();
		self.allocate_rings(rx_buf_len)
			.inspect_err(|err| error!("failed to allocate DMA resources: {err}"))?;

		if let Err(err) = self.bring_up(rx_buf_len, false) {
			self.free_rings();
			return Err(err);
		}

		if let Err(err) = self.hw.restore_registers() {
			error!("failed to restore registers: {err}");
			self.quiesce();
			return Err(err.into());
		}

		self.wake_queues();
		self.set_state(ChanState::Running);
		Ok(())
	}

	fn allocate_dma_resources(&self, rx_buf_len: usize) -> Result<(), DmaError> {
		let reserved = ReservedBuffer::allocate(rx_buf_len, &*self.mapper, &*self.pool)?;
		*self.reserved.lock() = Some(reserved);

		if let Err(err) = self.allocate_rings(rx_buf_len) {
			self.free_reserved();
			return Err(err);
		}
		Ok(())
	}

	fn free_dma_resources(&self) {
		self.free_rings();
		self.free_reserved();
	}

	fn free_reserved(&self) {
		if let Some(reserved) = self.reserved.lock().take() {
			reserved.free(&*self.mapper, &*self.pool);
		}
	}

	fn allocate_rings(&self, rx_buf_len: usize) -> Result<(), DmaError> {
		for ch in &self.channels {
			let rings = TxRing::allocate(self.cfg.tx_ring_size, &*self.mapper).and_then(|tx| {
				match RxRing::allocate_rx(self.cfg.rx_ring_size, rx_buf_len, &*self.mapper, &*self.pool) {
					Ok(rx) => Ok((tx, rx)),
					Err(err) => {
						free_tx_ring(&mut Some(tx), &*self.mapper, &*self.pool);
						Err(err)
					}
				}
			});

			match rings {
				Ok((tx, rx)) => {
					*ch.tx.lock() = Some(tx);
					*ch.rx.lock() = Some(rx);
				}
				Err(err) => {
					error!("failed to allocate rings of DMA channel {}: {err}", ch.chan);
					self.free_rings();
					return Err(err);
				}
			}
		}
		Ok(())
	}

	/// Releases the rings of every channel. Channels without rings are
	/// skipped.
	fn free_rings(&self) {
		for ch in &self.channels {
			free_tx_ring(&mut ch.tx.lock(), &*self.mapper, &*self.pool);
			free_rx_ring(&mut ch.rx.lock(), &*self.mapper, &*self.pool);
		}
	}

	fn dma_init(&self, rx_buf_len: usize) -> Result<(), HwError> {
		let chans: SmallVec<[ChanSetup; MAX_CHANS]> = self
			.channels
			.iter()
			.map(|ch| {
				let tx = ch.tx.lock();
				let rx = ch.rx.lock();
				ChanSetup {
					chan: ch.chan,
					tx_ring: tx.as_ref().map_or(0, TxRing::desc_dma),
					tx_len: tx.as_ref().map_or(0, TxRing::size),
					rx_ring: rx.as_ref().map_or(0, RxRing::desc_dma),
					rx_len: rx.as_ref().map_or(0, RxRing::size),
				}
			})
			.collect();

		self.hw.dma_init(&DmaSetup {
			chans: &chans,
			rx_buf_len,
			tx_usecs: self.cfg.tx_usecs,
			tx_frames: self.cfg.tx_frames,
			rx_riwt: self.cfg.rx_riwt,
			rx_frames: self.cfg.rx_frames,
		})
	}

	/// Starts the controller on freshly allocated rings, undoing its own
	/// steps on failure.
	fn bring_up(&self, rx_buf_len: usize, request_irqs: bool) -> Result<(), DmaError> {
		self.hw
			.core_init(self.cfg.tx_fifo_size, self.cfg.rx_fifo_size)
			.inspect_err(|err| error!("failed to initialize MAC core: {err}"))?;

		if let Err(err) = self.dma_init(rx_buf_len) {
			error!("failed to initialize MAC DMA: {err}");
			self.hw.core_deinit();
			return Err(err.into());
		}

		self.enable_napi();

		if request_irqs {
			if let Err(err) = self.request_irqs() {
				self.disable_napi();
				self.hw.dma_deinit();
				self.hw.core_deinit();
				return Err(err);
			}
		}

		let started = self
			.channels
			.iter()
			.try_for_each(|ch| ch.enable_interrupts(&*self.hw))
			.and_then(|()| self.hw.start_mac());
		if let Err(err) = started {
			error!("failed to start MAC: {err}");
			if request_irqs {
				self.free_irqs();
			}
			self.disable_napi();
			self.disable_interrupts();
			self.hw.dma_deinit();
			self.hw.core_deinit();
			return Err(err.into());
		}

		Ok(())
	}

	/// Stops polling and the controller, then releases the rings.
	fn quiesce(&self) {
		self.disable_napi();
		self.disable_interrupts();
		self.hw.dma_deinit();
		self.hw.core_deinit();
		self.free_rings();
		if self.cfg.tx_usecs.is_some() {
			for ch in &self.channels {
				ch.timer.cancel(&*self.runtime, ch.chan);
			}
		}
	}

	fn enable_napi(&self) {
		for ch in &self.channels {
			ch.napi.tx.enable();
			ch.napi.rx.enable();
		}
	}

	fn disable_napi(&self) {
		for ch in &self.channels {
			ch.napi
				.tx
				.disable(&self.pending, Direction::Tx.status_bit(ch.chan));
			ch.napi
				.rx
				.disable(&self.pending, Direction::Rx.status_bit(ch.chan));
		}
	}

	fn disable_interrupts(&self) {
		for ch in &self.channels {
			ch.disable_interrupts(&*self.hw);
		}
	}

	fn stop_queues(&self) {
		for ch in &self.channels {
			ch.queue_stopped.store(true, Ordering::Release);
			self.stack.stop_queue(ch.queue);
		}
	}

	fn wake_queues(&self) {
		for ch in &self.channels {
			ch.queue_stopped.store(false, Ordering::Release);
			self.stack.wake_queue(ch.queue);
		}
	}

	fn stop_queue(&self, ch: &Channel) {
		if !ch.queue_stopped.swap(true, Ordering::AcqRel) {
			self.stack.stop_queue(ch.queue);
		}
	}

	/// Queues `frame` on transmit queue `queue` and rings the doorbell.
	///
	/// A rejected frame is handed back; the caller drops it. A full ring
	/// also stops the queue, as does falling to the low-water mark after
	/// a successful enqueue. Both decisions are taken under the ring lock,
	/// the same lock the completion poll holds when it wakes the queue.
	pub fn xmit(&self, queue: usize, frame: TxFrame) -> Result<(), Rejected> {
		let ch = match self.queue(queue) {
			Ok(ch) => ch,
			Err(error) => return Err(Rejected { error, frame }),
		};

		let mut ring = ch.tx.lock();
		let state = ch.state.load();
		let tx = match ring.as_mut() {
			Some(tx) if state == ChanState::Running => tx,
			_ => {
				let error = DmaError::InvalidState {
					expected: ChanState::Running,
					found: state,
				};
				return Err(Rejected { error, frame });
			}
		};

		let cx = match binder::bind(tx, frame, self.cfg.tx_max_buf_len, &*self.mapper, &*self.pool) {
			Ok(cx) => cx,
			Err(rejected) => {
				if rejected.error == DmaError::WouldBlock {
					warn!("Tx ring[{}] full", ch.chan);
					update_stats_counter(&ch.stats.tx_ring_full_n, 1);
					self.stop_queue(ch);
				} else {
					update_stats_counter(&ch.stats.tx_drop_n, 1);
				}
				return Err(rejected);
			}
		};

		let ioc = match self.cfg.tx_frames {
			Some(frames) => {
				let cnt = ch.tx_frame_cnt.fetch_add(1, Ordering::Relaxed) + 1;
				cnt % frames == 0
			}
			None => true,
		};

		let tail = tx.publish(&cx, ioc);
		self.hw.transmit(ch.chan, tail);

		if let Some(usecs) = self.cfg.tx_usecs {
			ch.timer.arm(&*self.runtime, ch.chan, usecs);
		}

		if tx.avail() <= self.cfg.tx_low_water {
			self.stop_queue(ch);
		}
		Ok(())
	}

	/// Expiry callback of the coalescing timer of `chan`.
	pub fn tx_timer_expired(&self, chan: u32) {
		let Some(ch) = self.channel(chan) else {
			return;
		};

		update_stats_counter(&ch.stats.tx_usecs_swtimer_n, 1);
		ch.timer.expired();
		if ch.napi.tx.schedule_prep() {
			self.schedule(chan, Direction::Tx);
		}
	}

	/// Runs every poll task posted since the last call. Returns the number
	/// of polls run.
	pub fn run_pending(&self) -> usize {
		let pending = self.pending.swap(0, Ordering::AcqRel);
		let mut polls = 0;

		for (chan, dir) in PendingBits::new(pending) {
			let Some(ch) = self.channel(chan) else {
				continue;
			};
			match dir {
				Direction::Tx => self.poll_tx(ch),
				Direction::Rx => self.poll_rx(ch),
			}
			polls += 1;
		}

		polls
	}

	fn poll_tx(&self, ch: &Channel) {
		let budget = self.cfg.napi_weight;
		update_stats_counter(&ch.stats.tx_poll_n, 1);

		let mut done = SmallVec::<[TxDone; 16]>::new();
		let (processed, outstanding) = match ch.tx.lock().as_mut() {
			Some(tx) => {
				let processed = tx.reclaim(budget, &*self.mapper, &mut done);
				if tx.avail() > self.cfg.tx_low_water
					&& ch.queue_stopped.swap(false, Ordering::AcqRel)
				{
					self.stack.wake_queue(ch.queue);
				}
				(processed, !tx.is_empty())
			}
			None => (0, false),
		};

		for TxDone {
			frame,
			timestamp,
			error,
		} in done
		{
			if error {
				update_stats_counter(&ch.stats.tx_err_n, 1);
			}
			self.stack.tx_complete(frame, timestamp);
		}
		update_stats_counter(&ch.stats.tx_pkt_n, processed as u64);

		if outstanding {
			if let Some(usecs) = self.cfg.tx_usecs {
				ch.timer.arm(&*self.runtime, ch.chan, usecs);
			}
		}

		self.finish_poll(ch, Direction::Tx, processed, budget);
	}

	fn poll_rx(&self, ch: &Channel) {
		let budget = self.cfg.napi_weight;
		let buf_len = self.rx_buf_len();
		update_stats_counter(&ch.stats.rx_poll_n, 1);

		let mut done = SmallVec::new();
		let outcome = {
			let mut rx = ch.rx.lock();
			let reserved = self.reserved.lock();
			match (rx.as_mut(), reserved.as_ref()) {
				(Some(rx), Some(reserved)) => {
					let outcome =
						rx.reclaim(budget, buf_len, &*self.mapper, &*self.pool, reserved, &mut done);
					if outcome.processed > 0 {
						self.hw.update_rx_tail(ch.chan, rx.tail());
					}
					outcome
				}
				_ => RxReclaim::default(),
			}
		};

		update_stats_counter(&ch.stats.rx_pkt_n, done.len() as u64);
		update_stats_counter(&ch.stats.rx_err_n, outcome.errors as u64);
		update_stats_counter(&ch.stats.rx_drop_n, outcome.dropped as u64);
		update_stats_counter(&ch.stats.rx_buf_fallback_n, outcome.fallbacks as u64);
		for packet in done {
			self.stack.receive(ch.chan, packet);
		}

		self.finish_poll(ch, Direction::Rx, outcome.processed, budget);
	}

	/// Caught up: go idle and unmask the source. Out of budget: run again
	/// without waiting for an interrupt.
	fn finish_poll(&self, ch: &Channel, dir: Direction, work: usize, budget: usize) {
		let task = ch.napi.get(dir);
		if work < budget {
			if task.complete() {
				ch.set_interrupt(&*self.hw, dir, true);
			}
		} else if task.disable_pending() {
			// The source stays masked until the next open or resume.
			task.complete();
		} else {
			self.schedule(ch.chan, dir);
		}
	}

	/// Logs the bring-up summary.
	pub fn print_information(&self) {
		infoheader!(" NVETHERNET DMA ");
		infoentry!("MAC", "{:?} {:#x}", self.cfg.mac, self.cfg.mac_ver);
		infoentry!("DMA channels", "{:?}", self.cfg.dma_chans.as_slice());
		infoentry!("MTL queues", "{:?}", self.cfg.mtl_queues.as_slice());
		infoentry!("Interrupts", "{:?}", self.cfg.irq_topology());
		infoentry!(
			"Ring sizes",
			"tx {} / rx {}",
			self.cfg.tx_ring_size,
			self.cfg.rx_ring_size
		);
		infoentry!("MTU", self.mtu());
		infoentry!("Rx buffer length", self.rx_buf_len());
		infoentry!(
			"Tx coalescing",
			"{:?} usecs / {:?} frames",
			self.cfg.tx_usecs,
			self.cfg.tx_frames
		);
		infoentry!(
			"Rx coalescing",
			"{:?} riwt / {:?} frames",
			self.cfg.rx_riwt,
			self.cfg.rx_frames
		);
		infofooter!();
	}
}

impl Drop for Engine {
	fn drop(&mut self) {
		self.close();
	}
}

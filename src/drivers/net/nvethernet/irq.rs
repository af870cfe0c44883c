//! Interrupt lines of the controller and their handlers.
//!
//! Data-path handlers never touch a ring. They mask the interrupt source,
//! win the poll task's scheduled bit and post the task to the engine's
//! pending set; the worker runs the poll.

use core::sync::atomic::Ordering;

use smallvec::SmallVec;

use super::Engine;
use super::channel::update_stats_counter;
use crate::config::{DmaConfig, IrqTopology, MAX_CHANS, MAX_VM_IRQS};
use crate::drivers::error::DmaError;
use crate::drivers::osi::Direction;

/// What an interrupt line services.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqKind {
	/// MAC and DMA common/error status.
	Common,
	/// Transmit completions of one DMA channel.
	Tx(u32),
	/// Receive completions of one DMA channel.
	Rx(u32),
	/// A line shared by a group of channels, by index into the VM layout.
	Vm(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IrqLine {
	pub irq: u32,
	pub kind: IrqKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum IrqReturn {
	/// The line does not belong to this engine.
	None,
	Handled,
}

pub(crate) type IrqLines = SmallVec<[IrqLine; 1 + 2 * MAX_CHANS]>;

/// Set bits of a pending-status word as `(channel, direction)`, lowest
/// bit first.
#[derive(Clone, Copy, Debug)]
pub struct PendingBits(u32);

impl PendingBits {
	pub fn new(status: u32) -> Self {
		Self(status)
	}
}

impl Iterator for PendingBits {
	type Item = (u32, Direction);

	fn next(&mut self) -> Option<Self::Item> {
		if self.0 == 0 {
			return None;
		}
		let bit = self.0.trailing_zeros();
		self.0 &= !(1 << bit);
		Some((bit / 2, Direction::from_status_bit(bit)))
	}

	fn size_hint(&self) -> (usize, Option<usize>) {
		let n = self.0.count_ones() as usize;
		(n, Some(n))
	}
}

/// Status bits owned by a VM line serving `chans`.
pub(crate) fn vm_chan_mask(chans: &[u32]) -> u32 {
	chans
		.iter()
		.fold(0, |mask, &chan| mask | (0b11 << (2 * chan)))
}

/// Lines of the configured layout, in request order.
pub(crate) fn irq_lines(cfg: &DmaConfig) -> IrqLines {
	let mut lines = IrqLines::new();
	lines.push(IrqLine {
		irq: cfg.irqs.common,
		kind: IrqKind::Common,
	});

	match cfg.irq_topology() {
		IrqTopology::VmShared => {
			for (i, vm) in cfg.irqs.vm.iter().enumerate().take(MAX_VM_IRQS) {
				lines.push(IrqLine {
					irq: vm.irq,
					kind: IrqKind::Vm(i),
				});
			}
		}
		IrqTopology::PerChannel => {
			for (irqs, &chan) in cfg.irqs.chan.iter().zip(cfg.dma_chans.iter()) {
				lines.push(IrqLine {
					irq: irqs.rx,
					kind: IrqKind::Rx(chan),
				});
				lines.push(IrqLine {
					irq: irqs.tx,
					kind: IrqKind::Tx(chan),
				});
			}
		}
	}

	lines
}

impl Engine {
	/// Registers every line with the platform. On failure the lines
	/// acquired so far are released again.
	pub(crate) fn request_irqs(&self) -> Result<(), DmaError> {
		let mut alloc = self.irq_alloc.lock();
		for (i, line) in self.irq_lines.iter().enumerate() {
			if let Err(err) = self.runtime.request_irq(line) {
				error!("failed to register irq {} ({:?}): {err}", line.irq, line.kind);
				self.release_irqs(&mut alloc);
				return Err(err);
			}
			*alloc |= 1 << i;
		}
		Ok(())
	}

	pub(crate) fn free_irqs(&self) {
		let mut alloc = self.irq_alloc.lock();
		self.release_irqs(&mut alloc);
	}

	fn release_irqs(&self, alloc: &mut u32) {
		for (i, line) in self.irq_lines.iter().enumerate() {
			if *alloc & (1 << i) != 0 {
				self.runtime.free_irq(line);
			}
		}
		*alloc = 0;
	}

	/// Entry point for every line returned by [`irq_lines`](Engine::irq_lines).
	pub fn handle_irq(&self, kind: IrqKind) -> IrqReturn {
		match kind {
			IrqKind::Common => self.common_isr(),
			IrqKind::Tx(chan) => self.chan_isr(chan, Direction::Tx),
			IrqKind::Rx(chan) => self.chan_isr(chan, Direction::Rx),
			IrqKind::Vm(line) => self.vm_isr(line),
		}
	}

	fn common_isr(&self) -> IrqReturn {
		if let Err(err) = self.hw.handle_common_interrupt() {
			error!("Common interrupt handling failed: {err}");
		}
		IrqReturn::Handled
	}

	fn chan_isr(&self, chan: u32, dir: Direction) -> IrqReturn {
		let Some(ch) = self.channel(chan) else {
			return IrqReturn::None;
		};

		ch.set_interrupt(&*self.hw, dir, false);
		update_stats_counter(ch.irq_counter(dir), 1);

		if ch.napi.get(dir).schedule_prep() {
			self.schedule(chan, dir);
		} else if dir == Direction::Rx || self.cfg.tx_usecs.is_none() {
			// With the coalescing timer running, a scheduled Tx poll is expected.
			error!("{dir:?} poll of DMA channel {chan} already scheduled");
		}

		IrqReturn::Handled
	}

	fn vm_isr(&self, line: usize) -> IrqReturn {
		let Some(&mask) = self.vm_masks.get(line) else {
			return IrqReturn::None;
		};

		let _guard = self.vm_status_lock.lock();
		let status = match self.hw.global_dma_status() {
			Ok(status) => status & mask,
			Err(err) => {
				error!("Reading DMA status for VM line {line} failed: {err}");
				return IrqReturn::Handled;
			}
		};

		for (chan, dir) in PendingBits::new(status) {
			let Some(ch) = self.channel(chan) else {
				continue;
			};
			update_stats_counter(ch.irq_counter(dir), 1);
			if ch.napi.get(dir).schedule_prep() {
				ch.set_interrupt(&*self.hw, dir, false);
				self.schedule(chan, dir);
			}
		}

		IrqReturn::Handled
	}

	/// Posts a task whose scheduled bit the caller owns.
	pub(crate) fn schedule(&self, chan: u32, dir: Direction) {
		self.pending
			.fetch_or(1 << dir.status_bit(chan), Ordering::AcqRel);
		self.runtime.kick_poller();
	}
}

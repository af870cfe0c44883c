//! Scheduling state of the per-channel poll tasks.
//!
//! A task is scheduled at most once: the interrupt handler or the coalescing
//! timer wins [`PollTask::schedule_prep`], marks the task pending and the
//! worker runs it later. Only the winner may post the task; the poll that
//! runs clears the scheduled bit again once it caught up.

use core::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use crossbeam_utils::Backoff;

use crate::drivers::osi::Direction;

/// Scheduled, or owned by whoever disabled the task.
const SCHED: u8 = 1 << 0;
/// A disable is in progress or complete; scheduling is refused.
const DISABLE: u8 = 1 << 1;

#[derive(Debug)]
pub(crate) struct PollTask {
	state: AtomicU8,
}

impl PollTask {
	/// Tasks start out disabled.
	pub const fn new() -> Self {
		Self {
			state: AtomicU8::new(SCHED | DISABLE),
		}
	}

	/// Claims the right to schedule this task. Succeeds for exactly one
	/// caller until the task completes.
	pub fn schedule_prep(&self) -> bool {
		self.state
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
				(state & (SCHED | DISABLE) == 0).then_some(state | SCHED)
			})
			.is_ok()
	}

	/// Marks the task idle. Returns `false` while a disable is pending, in
	/// which case the caller must not unmask the interrupt again.
	pub fn complete(&self) -> bool {
		let prev = self.state.fetch_and(!SCHED, Ordering::AcqRel);
		prev & DISABLE == 0
	}

	pub fn disable_pending(&self) -> bool {
		self.state.load(Ordering::Acquire) & DISABLE != 0
	}

	pub fn is_scheduled(&self) -> bool {
		self.state.load(Ordering::Acquire) & SCHED != 0
	}

	/// Allows scheduling again after [`disable`](Self::disable).
	pub fn enable(&self) {
		self.state.store(0, Ordering::Release);
	}

	/// Waits until no poll of this task is queued or running and keeps it
	/// from being scheduled until [`enable`](Self::enable).
	///
	/// A queued poll that has not started is cancelled by clearing `bit`
	/// from `pending`. Disabling a disabled task returns immediately.
	pub fn disable(&self, pending: &AtomicU32, bit: u32) {
		if self.state.fetch_or(DISABLE, Ordering::AcqRel) & DISABLE != 0 {
			return;
		}

		let backoff = Backoff::new();
		loop {
			if self
				.state
				.compare_exchange(DISABLE, DISABLE | SCHED, Ordering::AcqRel, Ordering::Acquire)
				.is_ok()
			{
				return;
			}

			// Queued but not started: the scheduled bit is ours now.
			if pending.fetch_and(!(1 << bit), Ordering::AcqRel) & (1 << bit) != 0 {
				return;
			}

			backoff.snooze();
		}
	}
}

/// The two poll tasks of one channel.
#[derive(Debug)]
pub(crate) struct PollTasks {
	pub tx: PollTask,
	pub rx: PollTask,
}

impl PollTasks {
	pub const fn new() -> Self {
		Self {
			tx: PollTask::new(),
			rx: PollTask::new(),
		}
	}

	pub fn get(&self, dir: Direction) -> &PollTask {
		match dir {
			Direction::Tx => &self.tx,
			Direction::Rx => &self.rx,
		}
	}
}

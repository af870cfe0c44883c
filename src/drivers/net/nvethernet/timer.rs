//! Transmit coalescing timer.
//!
//! With frame-count coalescing the controller raises a completion interrupt
//! only every few frames. The timer bounds how long the rest may wait: it
//! is armed while descriptors are outstanding and schedules the transmit
//! poll on expiry, just like an interrupt would.

use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;

use super::Runtime;

#[derive(Debug)]
pub(crate) struct TxTimer {
	armed: AtomicBool,
}

impl TxTimer {
	pub const fn new() -> Self {
		Self {
			armed: AtomicBool::new(false),
		}
	}

	/// Starts the timer unless it is already running.
	pub fn arm(&self, runtime: &dyn Runtime, chan: u32, usecs: u32) {
		if !self.armed.swap(true, Ordering::AcqRel) {
			runtime.start_tx_timer(chan, Duration::from_micros(usecs.into()));
		}
	}

	/// Called from the expiry callback.
	pub fn expired(&self) {
		self.armed.store(false, Ordering::Release);
	}

	/// Stops the timer and waits for its callback. The callback clears
	/// `armed` before it returns, so the platform is asked even when the
	/// flag is already down.
	pub fn cancel(&self, runtime: &dyn Runtime, chan: u32) {
		runtime.cancel_tx_timer(chan);
		self.armed.store(false, Ordering::Release);
	}

	pub fn is_armed(&self) -> bool {
		self.armed.load(Ordering::Acquire)
	}
}

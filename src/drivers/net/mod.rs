pub mod nvethernet;

use crate::drivers::osi::buffer::TxFrame;
pub use crate::drivers::osi::ring::RxDone as RxPacket;

/// The network stack the engine delivers to.
///
/// All methods may be called from the poll worker; `stop_queue` is also
/// called from the transmit path. `stop_queue` and `wake_queue` run with the
/// transmit ring of `queue` locked and must not transmit on it synchronously.
pub trait NetStack: Send + Sync {
	/// A frame received on DMA channel `chan`.
	fn receive(&self, chan: u32, packet: RxPacket);

	/// The controller is done with `frame`. `timestamp` carries the
	/// transmit time in nanoseconds if one was requested and captured.
	fn tx_complete(&self, frame: TxFrame, timestamp: Option<u64>);

	/// Stop offering frames to transmit queue `queue`.
	fn stop_queue(&self, queue: usize);

	/// Transmit queue `queue` has room again.
	fn wake_queue(&self, queue: usize);
}

//! In-memory platform used by the unit tests.
//!
//! Every mock is a cheap handle around shared state, so a test can keep a
//! clone for inspection after handing one to the engine.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicIsize, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use core::time::Duration;

use hermit_sync::SpinMutex;

use crate::config::MAX_CHANS;
use crate::drivers::error::{DmaError, HwError};
use crate::drivers::net::NetStack;
use crate::drivers::net::nvethernet::{IrqLine, Runtime};
use crate::drivers::osi::buffer::{BufferPool, PacketBuffer, TxFrame};
use crate::drivers::osi::dma::{DmaAddr, DmaDirection, DmaMapper};
use crate::drivers::osi::ring::RxDone;
use crate::drivers::osi::{ChanSetup, Direction, DmaHw, DmaSetup};

/// Countdown to an injected failure: `-1` is off, `0` fails the next call.
#[derive(Debug)]
struct FailAfter(AtomicIsize);

impl FailAfter {
	fn new() -> Self {
		Self(AtomicIsize::new(-1))
	}

	fn set(&self, calls: usize) {
		self.0.store(calls as isize, Ordering::SeqCst);
	}

	fn hit(&self) -> bool {
		let prev = self
			.0
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
				-1 => None,
				0 => Some(-1),
				left => Some(left - 1),
			});
		prev == Ok(0)
	}
}

#[derive(Debug)]
struct MapperState {
	next: AtomicU64,
	streaming: SpinMutex<BTreeMap<DmaAddr, usize>>,
	coherent: SpinMutex<BTreeMap<DmaAddr, usize>>,
	fail: FailAfter,
}

/// Identity-free mapper handing out unique bus addresses.
#[derive(Clone, Debug)]
pub(crate) struct MockMapper(Arc<MapperState>);

impl MockMapper {
	pub fn new() -> Self {
		Self(Arc::new(MapperState {
			next: AtomicU64::new(0x1000),
			streaming: SpinMutex::new(BTreeMap::new()),
			coherent: SpinMutex::new(BTreeMap::new()),
			fail: FailAfter::new(),
		}))
	}

	/// Live streaming mappings.
	pub fn outstanding(&self) -> usize {
		self.0.streaming.lock().len()
	}

	/// Live coherent mappings.
	pub fn coherent(&self) -> usize {
		self.0.coherent.lock().len()
	}

	/// Lets `maps` streaming mappings succeed, then fails one.
	pub fn fail_after(&self, maps: usize) {
		self.0.fail.set(maps);
	}

	/// Records a streaming mapping not backed by a buffer.
	pub fn map_raw(&self, len: usize) -> DmaAddr {
		let addr = self.alloc_addr(len);
		self.0.streaming.lock().insert(addr, len);
		addr
	}

	fn alloc_addr(&self, len: usize) -> DmaAddr {
		let span = (len as u64 + 0xFFF) & !0xFFF;
		self.0.next.fetch_add(span.max(0x1000), Ordering::SeqCst)
	}

	fn map(&self, len: usize) -> Result<DmaAddr, DmaError> {
		if self.0.fail.hit() {
			return Err(DmaError::MappingFailed);
		}
		Ok(self.map_raw(len))
	}

	fn unmap(&self, addr: DmaAddr, len: usize) {
		let mapped = self.0.streaming.lock().remove(&addr);
		assert_eq!(mapped, Some(len), "unmap of {addr:#x} does not match a mapping");
	}
}

impl DmaMapper for MockMapper {
	fn map_single(
		&self,
		buf: &PacketBuffer,
		offset: usize,
		len: usize,
		_dir: DmaDirection,
	) -> Result<DmaAddr, DmaError> {
		assert!(offset + len <= buf.len());
		self.map(len)
	}

	fn map_page(
		&self,
		page: &PacketBuffer,
		offset: usize,
		len: usize,
		_dir: DmaDirection,
	) -> Result<DmaAddr, DmaError> {
		assert!(offset + len <= page.len());
		self.map(len)
	}

	fn unmap_single(&self, addr: DmaAddr, len: usize, _dir: DmaDirection) {
		self.unmap(addr, len);
	}

	fn unmap_page(&self, addr: DmaAddr, len: usize, _dir: DmaDirection) {
		self.unmap(addr, len);
	}

	fn map_coherent(&self, _cpu: NonNull<u8>, len: usize) -> Result<DmaAddr, DmaError> {
		let addr = self.alloc_addr(len);
		self.0.coherent.lock().insert(addr, len);
		Ok(addr)
	}

	fn unmap_coherent(&self, addr: DmaAddr, len: usize) {
		let mapped = self.0.coherent.lock().remove(&addr);
		assert_eq!(mapped, Some(len));
	}
}

#[derive(Debug)]
struct PoolState {
	outstanding: AtomicIsize,
	fail: FailAfter,
	fail_unshare: AtomicBool,
}

/// Heap-backed buffer pool counting live allocations.
#[derive(Clone, Debug)]
pub(crate) struct MockPool(Arc<PoolState>);

impl MockPool {
	pub fn new() -> Self {
		Self(Arc::new(PoolState {
			outstanding: AtomicIsize::new(0),
			fail: FailAfter::new(),
			fail_unshare: AtomicBool::new(false),
		}))
	}

	pub fn outstanding(&self) -> isize {
		self.0.outstanding.load(Ordering::SeqCst)
	}

	/// Lets `allocs` allocations succeed, then fails one.
	pub fn fail_after(&self, allocs: usize) {
		self.0.fail.set(allocs);
	}

	pub fn fail_unshare(&self, fail: bool) {
		self.0.fail_unshare.store(fail, Ordering::SeqCst);
	}
}

impl BufferPool for MockPool {
	fn alloc(&self, len: usize) -> Result<PacketBuffer, DmaError> {
		if self.0.fail.hit() {
			return Err(DmaError::OutOfMemory);
		}
		let buf = PacketBuffer::zeroed(len)?;
		self.0.outstanding.fetch_add(1, Ordering::SeqCst);
		Ok(buf)
	}

	fn release(&self, _buf: PacketBuffer) {
		self.0.outstanding.fetch_sub(1, Ordering::SeqCst);
	}

	fn unshare(&self, _buf: &mut PacketBuffer, _len: usize) -> Result<(), DmaError> {
		if self.0.fail_unshare.load(Ordering::SeqCst) {
			return Err(DmaError::OutOfMemory);
		}
		Ok(())
	}
}

/// Hardware call that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HwOp {
	CoreInit,
	DmaInit,
	StartMac,
	SetInterrupt,
	Status,
	Common,
	Save,
	Restore,
}

const HW_OPS: usize = 8;

#[derive(Debug)]
struct HwState {
	irq_enabled: SpinMutex<[[bool; 2]; MAX_CHANS]>,
	doorbells: SpinMutex<Vec<(u32, usize)>>,
	rx_tails: SpinMutex<Vec<(u32, usize)>>,
	setups: SpinMutex<Vec<Vec<ChanSetup>>>,
	status: AtomicU32,
	faults: [AtomicBool; HW_OPS],
	core_up: AtomicBool,
	dma_up: AtomicBool,
	saved: AtomicUsize,
	restored: AtomicUsize,
	common: AtomicUsize,
}

/// Register model recording what the engine asked the controller to do.
#[derive(Clone, Debug)]
pub(crate) struct MockHw(Arc<HwState>);

impl MockHw {
	pub fn new() -> Self {
		Self(Arc::new(HwState {
			irq_enabled: SpinMutex::new([[false; 2]; MAX_CHANS]),
			doorbells: SpinMutex::new(Vec::new()),
			rx_tails: SpinMutex::new(Vec::new()),
			setups: SpinMutex::new(Vec::new()),
			status: AtomicU32::new(0),
			faults: Default::default(),
			core_up: AtomicBool::new(false),
			dma_up: AtomicBool::new(false),
			saved: AtomicUsize::new(0),
			restored: AtomicUsize::new(0),
			common: AtomicUsize::new(0),
		}))
	}

	pub fn fail(&self, op: HwOp, fail: bool) {
		self.0.faults[op as usize].store(fail, Ordering::SeqCst);
	}

	fn check(&self, op: HwOp) -> Result<(), HwError> {
		if self.0.faults[op as usize].load(Ordering::SeqCst) {
			return Err(HwError(-5));
		}
		Ok(())
	}

	pub fn irq_enabled(&self, chan: u32, dir: Direction) -> bool {
		self.0.irq_enabled.lock()[chan as usize][dir as usize]
	}

	pub fn set_status(&self, status: u32) {
		self.0.status.store(status, Ordering::SeqCst);
	}

	pub fn doorbells(&self) -> Vec<(u32, usize)> {
		self.0.doorbells.lock().clone()
	}

	pub fn rx_tails(&self) -> Vec<(u32, usize)> {
		self.0.rx_tails.lock().clone()
	}

	/// Rings handed to every `dma_init` so far.
	pub fn setups(&self) -> Vec<Vec<ChanSetup>> {
		self.0.setups.lock().clone()
	}

	pub fn core_up(&self) -> bool {
		self.0.core_up.load(Ordering::SeqCst)
	}

	pub fn dma_up(&self) -> bool {
		self.0.dma_up.load(Ordering::SeqCst)
	}

	pub fn saved(&self) -> usize {
		self.0.saved.load(Ordering::SeqCst)
	}

	pub fn restored(&self) -> usize {
		self.0.restored.load(Ordering::SeqCst)
	}

	pub fn common_handled(&self) -> usize {
		self.0.common.load(Ordering::SeqCst)
	}
}

impl DmaHw for MockHw {
	fn core_init(&self, _tx_fifo_size: u32, _rx_fifo_size: u32) -> Result<(), HwError> {
		self.check(HwOp::CoreInit)?;
		self.0.core_up.store(true, Ordering::SeqCst);
		Ok(())
	}

	fn core_deinit(&self) {
		self.0.core_up.store(false, Ordering::SeqCst);
	}

	fn dma_init(&self, setup: &DmaSetup<'_>) -> Result<(), HwError> {
		self.check(HwOp::DmaInit)?;
		self.0.setups.lock().push(setup.chans.to_vec());
		self.0.dma_up.store(true, Ordering::SeqCst);
		Ok(())
	}

	fn dma_deinit(&self) {
		self.0.dma_up.store(false, Ordering::SeqCst);
	}

	fn start_mac(&self) -> Result<(), HwError> {
		self.check(HwOp::StartMac)
	}

	fn transmit(&self, chan: u32, tail: usize) {
		self.0.doorbells.lock().push((chan, tail));
	}

	fn update_rx_tail(&self, chan: u32, tail: usize) {
		self.0.rx_tails.lock().push((chan, tail));
	}

	fn set_dma_interrupt(&self, chan: u32, dir: Direction, enable: bool) -> Result<(), HwError> {
		self.check(HwOp::SetInterrupt)?;
		self.0.irq_enabled.lock()[chan as usize][dir as usize] = enable;
		Ok(())
	}

	fn global_dma_status(&self) -> Result<u32, HwError> {
		self.check(HwOp::Status)?;
		Ok(self.0.status.load(Ordering::SeqCst))
	}

	fn handle_common_interrupt(&self) -> Result<(), HwError> {
		self.0.common.fetch_add(1, Ordering::SeqCst);
		self.check(HwOp::Common)
	}

	fn save_registers(&self) -> Result<(), HwError> {
		self.check(HwOp::Save)?;
		self.0.saved.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}

	fn restore_registers(&self) -> Result<(), HwError> {
		self.check(HwOp::Restore)?;
		self.0.restored.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}
}

#[derive(Debug)]
struct RuntimeState {
	kicks: AtomicUsize,
	timers: SpinMutex<[Option<Duration>; MAX_CHANS]>,
	timer_starts: AtomicUsize,
	timer_cancels: AtomicUsize,
	irqs: SpinMutex<Vec<IrqLine>>,
	requests: AtomicUsize,
	fail_request: FailAfter,
}

/// Scheduler, timer and interrupt-controller side of the platform.
#[derive(Clone, Debug)]
pub(crate) struct MockRuntime(Arc<RuntimeState>);

impl MockRuntime {
	pub fn new() -> Self {
		Self(Arc::new(RuntimeState {
			kicks: AtomicUsize::new(0),
			timers: SpinMutex::new([None; MAX_CHANS]),
			timer_starts: AtomicUsize::new(0),
			timer_cancels: AtomicUsize::new(0),
			irqs: SpinMutex::new(Vec::new()),
			requests: AtomicUsize::new(0),
			fail_request: FailAfter::new(),
		}))
	}

	pub fn kicks(&self) -> usize {
		self.0.kicks.load(Ordering::SeqCst)
	}

	/// Delay of the running timer of `chan`, if any.
	pub fn timer(&self, chan: u32) -> Option<Duration> {
		self.0.timers.lock()[chan as usize]
	}

	/// Simulates expiry: the timer is gone once its callback runs.
	pub fn take_timer(&self, chan: u32) -> Option<Duration> {
		self.0.timers.lock()[chan as usize].take()
	}

	pub fn timer_starts(&self) -> usize {
		self.0.timer_starts.load(Ordering::SeqCst)
	}

	pub fn timer_cancels(&self) -> usize {
		self.0.timer_cancels.load(Ordering::SeqCst)
	}

	/// Lines currently registered.
	pub fn irqs(&self) -> Vec<IrqLine> {
		self.0.irqs.lock().clone()
	}

	pub fn requests(&self) -> usize {
		self.0.requests.load(Ordering::SeqCst)
	}

	/// Lets `requests` IRQ requests succeed, then fails one.
	pub fn fail_request_after(&self, requests: usize) {
		self.0.fail_request.set(requests);
	}
}

impl Runtime for MockRuntime {
	fn kick_poller(&self) {
		self.0.kicks.fetch_add(1, Ordering::SeqCst);
	}

	fn start_tx_timer(&self, chan: u32, delay: Duration) {
		let mut timers = self.0.timers.lock();
		assert!(timers[chan as usize].is_none(), "timer {chan} armed twice");
		timers[chan as usize] = Some(delay);
		self.0.timer_starts.fetch_add(1, Ordering::SeqCst);
	}

	fn cancel_tx_timer(&self, chan: u32) {
		self.0.timers.lock()[chan as usize] = None;
		self.0.timer_cancels.fetch_add(1, Ordering::SeqCst);
	}

	fn request_irq(&self, line: &IrqLine) -> Result<(), DmaError> {
		self.0.requests.fetch_add(1, Ordering::SeqCst);
		if self.0.fail_request.hit() {
			return Err(DmaError::Busy);
		}
		let mut irqs = self.0.irqs.lock();
		assert!(!irqs.contains(line), "{line:?} requested twice");
		irqs.push(*line);
		Ok(())
	}

	fn free_irq(&self, line: &IrqLine) {
		let mut irqs = self.0.irqs.lock();
		let pos = irqs.iter().position(|held| held == line);
		assert!(pos.is_some(), "{line:?} freed but not held");
		if let Some(pos) = pos {
			irqs.remove(pos);
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum QueueEvent {
	Stop(usize),
	Wake(usize),
}

#[derive(Debug)]
struct StackState {
	received: SpinMutex<Vec<(u32, RxDone)>>,
	completed: SpinMutex<Vec<(TxFrame, Option<u64>)>>,
	events: SpinMutex<Vec<QueueEvent>>,
}

/// Network stack collecting everything the engine hands upwards.
#[derive(Clone, Debug)]
pub(crate) struct MockStack(Arc<StackState>);

impl MockStack {
	pub fn new() -> Self {
		Self(Arc::new(StackState {
			received: SpinMutex::new(Vec::new()),
			completed: SpinMutex::new(Vec::new()),
			events: SpinMutex::new(Vec::new()),
		}))
	}

	pub fn take_received(&self) -> Vec<(u32, RxDone)> {
		core::mem::take(&mut *self.0.received.lock())
	}

	pub fn take_completed(&self) -> Vec<(TxFrame, Option<u64>)> {
		core::mem::take(&mut *self.0.completed.lock())
	}

	pub fn take_events(&self) -> Vec<QueueEvent> {
		core::mem::take(&mut *self.0.events.lock())
	}
}

impl NetStack for MockStack {
	fn receive(&self, chan: u32, packet: RxDone) {
		self.0.received.lock().push((chan, packet));
	}

	fn tx_complete(&self, frame: TxFrame, timestamp: Option<u64>) {
		self.0.completed.lock().push((frame, timestamp));
	}

	fn stop_queue(&self, queue: usize) {
		self.0.events.lock().push(QueueEvent::Stop(queue));
	}

	fn wake_queue(&self, queue: usize) {
		self.0.events.lock().push(QueueEvent::Wake(queue));
	}
}

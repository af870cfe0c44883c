//! Architecture-specific ordering primitives for descriptor memory.

/// Orders all preceding memory accesses before any following one.
///
/// Separates populating a descriptor from handing it to the DMA engine and
/// reading a write-back status from reading the rest of the write-back.
#[cfg(target_arch = "x86_64")]
#[inline]
pub(crate) fn memory_barrier() {
	use core::arch::asm;
	unsafe {
		asm!("mfence", options(nostack, preserves_flags));
	}
}

#[cfg(target_arch = "aarch64")]
#[inline]
pub(crate) fn memory_barrier() {
	use core::arch::asm;
	unsafe {
		asm!("dmb osh", options(nostack, preserves_flags));
	}
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline]
pub(crate) fn memory_barrier() {
	core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

//! Overwrite-tolerant SPSC frame ring with lock-out/release semantics.
//!
//! Frames pushed to the ring are stamped with a monotonic count, the number
//! of pushes since the ring was created. The element holding count `n` can be
//! locked out of the rotation for reading and later released; lock-out swaps
//! the element's storage with a spare so the producer can keep overwriting
//! the ring while the reader holds stable memory. If the producer has lapped
//! past `n`, the reader receives the element occupying that position along
//! with the count it actually got. If the consumer falls behind, the oldest
//! frames are silently overwritten; the producer never blocks.
//!
//! # Thread Safety
//!
//! Designed for single-producer/single-consumer use. Each slot carries its
//! own mutex so a lock-out cannot collide with the producer mid-push; a
//! single atomic index enforces at most one outstanding reader. The per-slot
//! mutex is the only lock on the hot path and is held only across one copy
//! or pointer swap.

use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI64, AtomicIsize, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Spins before the wait loop starts yielding to the scheduler.
const SPIN_RETRIES: u32 = 16;

/// Failure modes of a lock-out request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockOutError {
    /// Another element is already locked out.
    Busy,
    /// The requested count did not become available before the deadline.
    Timeout,
}

impl std::fmt::Display for LockOutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockOutError::Busy => write!(f, "another element is locked out"),
            LockOutError::Timeout => write!(f, "requested count not available"),
        }
    }
}

impl std::error::Error for LockOutError {}

struct Slot<T> {
    lock: Mutex<()>,
    /// Count of the frame currently stored, or -1 if empty. Polled by the
    /// consumer outside the slot lock.
    count: AtomicI64,
    buf: UnsafeCell<Vec<T>>,
}

impl<T: Copy + Default> Slot<T> {
    fn new(frame_len: usize) -> Self {
        Self {
            lock: Mutex::new(()),
            count: AtomicI64::new(-1),
            buf: UnsafeCell::new(vec![T::default(); frame_len]),
        }
    }
}

/// Fixed-capacity ring of frame buffers. See the module docs.
pub struct FrameRing<T> {
    slots: Box<[Slot<T>]>,
    /// Storage swapped in to replace an element when it is locked out.
    spare_buf: UnsafeCell<Vec<T>>,
    spare_count: AtomicI64,
    /// Ring index the producer writes next.
    head: AtomicUsize,
    /// Cumulative push count; -1 before the first push.
    counter: AtomicI64,
    /// Ring index of the locked-out element, -1 if none.
    locked: AtomicIsize,
    frame_len: usize,
}

// SAFETY: the raw storage behind the UnsafeCells is only touched while
// holding the owning slot's mutex (producer paths, the lock-out swap) or
// while `locked` designates the caller as the sole reader of the spare.
unsafe impl<T: Send> Send for FrameRing<T> {}
unsafe impl<T: Send> Sync for FrameRing<T> {}

impl<T: Copy + Default + 'static> FrameRing<T> {
    /// Allocate a ring of `ring_size` frames of `frame_len` elements, plus
    /// the spare used for lock-out substitution.
    pub fn new(ring_size: usize, frame_len: usize) -> Arc<Self> {
        assert!(ring_size > 0, "ring must hold at least one frame");
        assert!(frame_len > 0, "frames must be non-empty");
        let slots: Vec<Slot<T>> = (0..ring_size).map(|_| Slot::new(frame_len)).collect();
        Arc::new(Self {
            slots: slots.into_boxed_slice(),
            spare_buf: UnsafeCell::new(vec![T::default(); frame_len]),
            spare_count: AtomicI64::new(-1),
            head: AtomicUsize::new(0),
            counter: AtomicI64::new(-1),
            locked: AtomicIsize::new(-1),
            frame_len,
        })
    }

    pub fn ring_size(&self) -> usize {
        self.slots.len()
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Count of the most recently pushed frame, or -1 if none yet.
    pub fn count(&self) -> i64 {
        self.counter.load(Ordering::Acquire)
    }

    /// Copy one frame into the head slot, stamp it with the next monotonic
    /// count, and advance the head. Never blocks the producer for longer
    /// than one lock-out swap; never fails. Returns the ring index written.
    pub fn push(&self, src: &[T]) -> usize {
        assert_eq!(src.len(), self.frame_len, "pushed frame has wrong length");
        let head = self.head.load(Ordering::Relaxed);
        let slot = &self.slots[head];
        let guard = slot.lock.lock();
        // SAFETY: the slot mutex gives exclusive access to this slot's
        // storage; a concurrent lock-out of the same slot serializes on it.
        unsafe {
            (*slot.buf.get()).copy_from_slice(src);
        }
        self.stamp_and_advance(head);
        drop(guard);
        head
    }

    /// Producer-side direct-write path that avoids one copy: lock the head
    /// slot and hand out its buffer. Dropping the returned [`HeadSlot`]
    /// stamps the count and advances the head.
    pub fn lock_out_head(self: &Arc<Self>) -> HeadSlot<T> {
        let head = self.head.load(Ordering::Relaxed);
        let slot = &self.slots[head];
        // Hold the slot lock for the lifetime of the guard; HeadSlot::drop
        // releases it through force_unlock.
        std::mem::forget(slot.lock.lock());
        // SAFETY: the slot mutex is held (and leaked above), so this storage
        // is exclusively ours until the guard drops.
        let (ptr, len) = unsafe {
            let buf = &mut *slot.buf.get();
            (buf.as_mut_ptr(), buf.len())
        };
        HeadSlot {
            ring: Arc::clone(self),
            index: head,
            ptr,
            len,
        }
    }

    /// Lock out the element whose monotonic count is `n`, waiting up to
    /// `deadline` for it to be pushed. Fails immediately with
    /// [`LockOutError::Busy`] if another lock-out is held. On success the
    /// element's storage is swapped with the spare and the frame actually
    /// received is reported through [`LockedFrame::count`], which differs
    /// from `n` exactly when the producer has already lapped past it.
    pub fn lock_out(
        self: &Arc<Self>,
        n: i64,
        deadline: Duration,
    ) -> Result<LockedFrame<T>, LockOutError> {
        assert!(n >= 0, "frame counts are non-negative");
        if self.locked.load(Ordering::Acquire) != -1 {
            return Err(LockOutError::Busy);
        }
        let requested = (n as usize) % self.slots.len();
        let slot = &self.slots[requested];

        let start = Instant::now();
        let mut retries = 0u32;
        while slot.count.load(Ordering::Acquire) < n {
            if start.elapsed() >= deadline {
                return Err(LockOutError::Timeout);
            }
            if retries < SPIN_RETRIES {
                std::hint::spin_loop();
                retries += 1;
            } else {
                std::thread::yield_now();
            }
        }

        let guard = slot.lock.lock();
        if self
            .locked
            .compare_exchange(-1, requested as isize, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(LockOutError::Busy);
        }
        let got = slot.count.load(Ordering::Acquire);
        let retired = self.spare_count.load(Ordering::Relaxed);
        // SAFETY: the slot mutex is held and `locked` now names this slot,
        // so both buffers are exclusively ours for the swap. Swapping the
        // Vecs exchanges storage, not data.
        unsafe {
            std::mem::swap(&mut *slot.buf.get(), &mut *self.spare_buf.get());
        }
        slot.count.store(retired, Ordering::Release);
        self.spare_count.store(got, Ordering::Relaxed);
        drop(guard);

        trace!(requested = n, got, "locked out frame");
        // SAFETY: `locked` != -1 guards the spare until release.
        let (ptr, len) = unsafe {
            let buf = &*self.spare_buf.get();
            (buf.as_ptr(), buf.len())
        };
        Ok(LockedFrame {
            ring: Arc::clone(self),
            count: got,
            ptr,
            len,
        })
    }

    /// Non-waiting variant of [`FrameRing::lock_out`].
    pub fn try_lock_out(self: &Arc<Self>, n: i64) -> Result<LockedFrame<T>, LockOutError> {
        self.lock_out(n, Duration::ZERO)
    }

    /// Reset every element to empty, rewind the head, and zero the counter,
    /// restoring the freshly-constructed observable state. Must not be
    /// called while a lock-out is outstanding.
    pub fn clear(&self) {
        debug_assert_eq!(self.locked.load(Ordering::Acquire), -1);
        for slot in self.slots.iter() {
            let guard = slot.lock.lock();
            slot.count.store(-1, Ordering::Release);
            // SAFETY: slot mutex held.
            unsafe {
                (*slot.buf.get()).fill(T::default());
            }
            drop(guard);
        }
        self.spare_count.store(-1, Ordering::Relaxed);
        self.head.store(0, Ordering::Release);
        self.counter.store(-1, Ordering::Release);
    }

    fn stamp_and_advance(&self, index: usize) {
        let next = self.counter.load(Ordering::Relaxed) + 1;
        self.slots[index].count.store(next, Ordering::Release);
        self.counter.store(next, Ordering::Release);
        self.head
            .store((index + 1) % self.slots.len(), Ordering::Release);
    }

    fn release_head(&self, index: usize) {
        self.stamp_and_advance(index);
        // SAFETY: lock_out_head leaked the guard for this slot's mutex and
        // exactly one HeadSlot exists per leak.
        unsafe {
            self.slots[index].lock.force_unlock();
        }
    }

    fn release_locked(&self) {
        self.locked.store(-1, Ordering::Release);
    }
}

/// Exclusive write access to the head slot, handed out by
/// [`FrameRing::lock_out_head`]. Dropping the guard stamps the next count
/// and advances the head, publishing the frame.
pub struct HeadSlot<T: Copy + Default + 'static> {
    ring: Arc<FrameRing<T>>,
    index: usize,
    ptr: *mut T,
    len: usize,
}

// SAFETY: the guard owns the slot mutex until drop; the raw pointer stays
// valid because the ring (kept alive by the Arc) never reallocates slot
// storage while the slot is locked.
unsafe impl<T: Copy + Default + Send + 'static> Send for HeadSlot<T> {}

impl<T: Copy + Default + 'static> HeadSlot<T> {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<T: Copy + Default + 'static> std::ops::Deref for HeadSlot<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: exclusive access per the slot mutex held by this guard.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl<T: Copy + Default + 'static> std::ops::DerefMut for HeadSlot<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: as above; &mut self precludes aliasing.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl<T: Copy + Default + 'static> Drop for HeadSlot<T> {
    fn drop(&mut self) {
        self.ring.release_head(self.index);
    }
}

/// Read access to a locked-out frame. Dropping the guard releases the
/// element back into rotation.
pub struct LockedFrame<T: Copy + Default + 'static> {
    ring: Arc<FrameRing<T>>,
    count: i64,
    ptr: *const T,
    len: usize,
}

// SAFETY: the `locked` index guards the spare storage exclusively for this
// guard; the Arc keeps the storage alive.
unsafe impl<T: Copy + Default + Send + 'static> Send for LockedFrame<T> {}

impl<T: Copy + Default + 'static> LockedFrame<T> {
    /// The monotonic count of the frame actually received.
    pub fn count(&self) -> i64 {
        self.count
    }
}

impl<T: Copy + Default + 'static> std::ops::Deref for LockedFrame<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: sole reader of the spare while `locked` != -1.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl<T: Copy + Default + 'static> std::fmt::Debug for LockedFrame<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedFrame")
            .field("count", &self.count)
            .field("len", &self.len)
            .finish()
    }
}

impl<T: Copy + Default + 'static> PartialEq for LockedFrame<T> {
    fn eq(&self, other: &Self) -> bool {
        self.count == other.count && self.ptr == other.ptr && self.len == other.len
    }
}

impl<T: Copy + Default + 'static> Drop for LockedFrame<T> {
    fn drop(&mut self) {
        self.ring.release_locked();
    }
}

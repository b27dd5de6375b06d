//! SPSC 无锁环形缓冲区
//!
//! 解码线程（生产者）与引擎拉取端（消费者）之间传递交织 PCM。
//! 读写都是 wait-free 的，内存只在构造时分配一次。

use std::cell::UnsafeCell;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// 单生产者单消费者环形缓冲区
///
/// 读写位置各占一条 cache line；位置只增不减，用 `wrapping_sub` 求占用量。
pub struct RingBuffer<T: Copy + Default> {
    slots: Box<[UnsafeCell<T>]>,
    mask: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    locked: AtomicBool,
}

unsafe impl<T: Copy + Default + Send> Send for RingBuffer<T> {}
unsafe impl<T: Copy + Default + Send> Sync for RingBuffer<T> {}

impl<T: Copy + Default> RingBuffer<T> {
    /// 容量向上取整到 2 的幂
    pub fn new(min_capacity: usize) -> Self {
        let capacity = min_capacity.max(1).next_power_of_two();
        let slots: Vec<UnsafeCell<T>> = (0..capacity)
            .map(|_| UnsafeCell::new(T::default()))
            .collect();

        Self {
            slots: slots.into_boxed_slice(),
            mask: capacity - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            locked: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// 用 mlock 把存储锁在物理内存里
    pub fn lock_memory(&self) -> io::Result<()> {
        if self.locked.load(Ordering::Acquire) {
            return Ok(());
        }

        let (ptr, len) = self.region();
        if unsafe { libc::mlock(ptr, len) } != 0 {
            let err = io::Error::last_os_error();
            log::warn!("Failed to lock ring buffer memory: {}", err);
            return Err(err);
        }

        self.locked.store(true, Ordering::Release);
        log::debug!("Ring buffer memory locked: {} bytes", len);
        Ok(())
    }

    pub fn unlock_memory(&self) {
        if self.locked.swap(false, Ordering::AcqRel) {
            let (ptr, len) = self.region();
            unsafe {
                libc::munlock(ptr, len);
            }
            log::debug!("Ring buffer memory unlocked");
        }
    }

    pub fn is_memory_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    fn region(&self) -> (*const libc::c_void, usize) {
        (
            self.slots.as_ptr() as *const libc::c_void,
            self.slots.len() * std::mem::size_of::<UnsafeCell<T>>(),
        )
    }

    /// 生产者写入，返回实际写入数
    #[inline]
    pub fn write(&self, data: &[T]) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let used = tail.wrapping_sub(head);
        debug_assert!(used <= self.capacity());

        let count = data.len().min(self.capacity() - used);
        let start = tail & self.mask;
        let first = count.min(self.capacity() - start);

        // 分两段拷贝：[start, end) 和环绕后的 [0, rest)
        for (slot, value) in self.slots[start..start + first].iter().zip(&data[..first]) {
            unsafe { *slot.get() = *value };
        }
        for (slot, value) in self.slots[..count - first].iter().zip(&data[first..count]) {
            unsafe { *slot.get() = *value };
        }

        self.tail.store(tail.wrapping_add(count), Ordering::Release);
        count
    }

    /// 消费者读取，返回实际读取数
    #[inline]
    pub fn read(&self, out: &mut [T]) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);

        let count = out.len().min(tail.wrapping_sub(head));
        let start = head & self.mask;
        let first = count.min(self.capacity() - start);

        for (value, slot) in out[..first].iter_mut().zip(&self.slots[start..start + first]) {
            *value = unsafe { *slot.get() };
        }
        for (value, slot) in out[first..count].iter_mut().zip(&self.slots[..count - first]) {
            *value = unsafe { *slot.get() };
        }

        self.head.store(head.wrapping_add(count), Ordering::Release);
        count
    }

    #[inline]
    pub fn available(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    #[inline]
    pub fn free_space(&self) -> usize {
        self.capacity() - self.available()
    }

    #[inline]
    pub fn fill_ratio(&self) -> f64 {
        self.available() as f64 / self.capacity() as f64
    }

    /// 丢弃所有未读数据，只能由消费者调用
    pub fn clear(&self) {
        let tail = self.tail.load(Ordering::Acquire);
        self.head.store(tail, Ordering::Release);
    }
}

impl<T: Copy + Default> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}

//! Software device model.
//!
//! A [`DeviceStream`] executes enqueued work in order on its own worker
//! thread, so host calls return as soon as the work is queued. Buffers live
//! behind shared locks and are only touched by jobs on the stream, except for
//! growth, which happens on the host and discards the contents.

use bytemuck::{Pod, Zeroable};
use rcs_core::{ConstraintError, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::JoinHandle;

/// `f32` with atomic load, store and add.
#[derive(Debug, Default)]
#[repr(transparent)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    #[inline]
    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Add `value`, returning the previous value.
    #[inline]
    pub fn fetch_add(&self, value: f32) -> f32 {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let next = (f32::from_bits(current) + value).to_bits();
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(previous) => return f32::from_bits(previous),
                Err(actual) => current = actual,
            }
        }
    }
}

/// Constraint endpoints as stored on the device. Dummy threads use `-1`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct DeviceAtomPair {
    pub i: i32,
    pub j: i32,
}

impl DeviceAtomPair {
    pub const DUMMY: Self = Self { i: -1, j: -1 };

    #[inline]
    pub fn is_dummy(&self) -> bool {
        self.i < 0
    }
}

/// Element type of a [`DeviceBuffer`].
pub trait DeviceElement: Send + Sync + 'static {
    /// Value type used for host transfers.
    type Host: Copy + Send + 'static;

    fn zeroed() -> Self;
    fn store(&mut self, value: Self::Host);
    fn load(&self) -> Self::Host;
}

macro_rules! plain_device_element {
    ($($t:ty),*) => {
        $(
            impl DeviceElement for $t {
                type Host = $t;

                fn zeroed() -> Self {
                    Zeroable::zeroed()
                }

                fn store(&mut self, value: $t) {
                    *self = value;
                }

                fn load(&self) -> $t {
                    *self
                }
            }
        )*
    };
}

plain_device_element!(f32, i32, [f32; 3], DeviceAtomPair);

impl DeviceElement for AtomicF32 {
    type Host = f32;

    fn zeroed() -> Self {
        AtomicF32::new(0.0)
    }

    fn store(&mut self, value: f32) {
        *self.0.get_mut() = value.to_bits();
    }

    fn load(&self) -> f32 {
        AtomicF32::load(self)
    }
}

pub(crate) type Shared<T> = Arc<RwLock<Vec<T>>>;

pub(crate) fn read<T>(lock: &RwLock<Vec<T>>) -> RwLockReadGuard<'_, Vec<T>> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<Vec<T>>) -> RwLockWriteGuard<'_, Vec<T>> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Capacity for a grow-only reallocation of `n` elements.
fn over_alloc_large(n: usize) -> usize {
    (1.19 * n as f64) as usize + 1000
}

/// Device allocation with a logical size and a grow-only capacity.
pub struct DeviceBuffer<T: DeviceElement> {
    name: &'static str,
    data: Shared<T>,
    size: usize,
    capacity: usize,
    reallocations: usize,
}

impl<T: DeviceElement> DeviceBuffer<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            data: Arc::new(RwLock::new(Vec::new())),
            size: 0,
            capacity: 0,
            reallocations: 0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of times the allocation has grown.
    pub fn reallocations(&self) -> usize {
        self.reallocations
    }

    /// Set the logical size to `n`, growing the allocation if needed.
    /// Contents are undefined after growth. Growth installs a new
    /// allocation, so work already queued keeps reading the old one.
    pub fn reallocate(&mut self, n: usize) {
        self.size = n;
        if n > self.capacity {
            self.capacity = over_alloc_large(n);
            let mut fresh = Vec::with_capacity(self.capacity);
            fresh.resize_with(self.capacity, T::zeroed);
            self.data = Arc::new(RwLock::new(fresh));
            self.reallocations += 1;
            log::debug!(
                "device buffer `{}` grown to {} elements",
                self.name,
                self.capacity
            );
        }
    }

    fn check_fits(&self, requested: usize) -> Result<()> {
        if requested > self.size {
            return Err(ConstraintError::DeviceBufferTooSmall {
                name: self.name,
                capacity: self.size,
                requested,
            });
        }
        Ok(())
    }

    /// Queue an upload of `host` to the start of the buffer.
    pub fn copy_to_device(&self, stream: &DeviceStream, host: Vec<T::Host>) -> Result<()> {
        self.check_fits(host.len())?;
        let data = Arc::clone(&self.data);
        stream.enqueue(move || {
            let mut device = write(&data);
            for (slot, value) in device.iter_mut().zip(host) {
                slot.store(value);
            }
        })
    }

    /// Download the first `n` elements once all prior work on `stream` has
    /// completed. Blocks the host.
    pub fn copy_from_device(&self, stream: &DeviceStream, n: usize) -> Result<Vec<T::Host>> {
        self.check_fits(n)?;
        let data = Arc::clone(&self.data);
        let (tx, rx) = mpsc::channel();
        stream.enqueue(move || {
            let device = read(&data);
            let values: Vec<T::Host> = device[..n].iter().map(T::load).collect();
            let _ = tx.send(values);
        })?;
        rx.recv().map_err(|_| ConstraintError::StreamClosed)
    }

    /// Queue zeroing of the logical range.
    pub fn clear(&self, stream: &DeviceStream) -> Result<()> {
        let data = Arc::clone(&self.data);
        let n = self.size;
        stream.enqueue(move || {
            for slot in write(&data)[..n].iter_mut() {
                *slot = T::zeroed();
            }
        })
    }

    pub(crate) fn shared(&self) -> Shared<T> {
        Arc::clone(&self.data)
    }
}

impl<T: DeviceElement> std::fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Host-visible completion marker for work on a stream.
#[derive(Debug, Clone, Default)]
pub struct GpuEvent {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl GpuEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self) {
        let (lock, cvar) = &*self.state;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_ready(&self) -> bool {
        *self.state.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the event has been marked.
    pub fn wait(&self) {
        let (lock, cvar) = &*self.state;
        let mut ready = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !*ready {
            ready = cvar.wait(ready).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Marks its event when dropped, whether or not the owning job ran.
struct MarkOnDrop(GpuEvent);

impl Drop for MarkOnDrop {
    fn drop(&mut self) {
        self.0.mark();
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// In-order work queue with its own worker thread.
pub struct DeviceStream {
    name: String,
    sender: Option<Sender<Job>>,
    failed: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl DeviceStream {
    fn spawn(name: String) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let failed = Arc::new(AtomicBool::new(false));
        let worker_failed = Arc::clone(&failed);
        let worker = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                for job in receiver {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        worker_failed.store(true, Ordering::SeqCst);
                        log::error!("a job on a device stream panicked; closing the stream");
                        break;
                    }
                }
            })
            .map_err(|e| {
                ConstraintError::InvalidParameter(format!("cannot start device stream: {e}"))
            })?;
        Ok(Self {
            name,
            sender: Some(sender),
            failed,
            worker: Some(worker),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `job` behind all previously enqueued work.
    pub fn enqueue<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.failed.load(Ordering::SeqCst) {
            return Err(ConstraintError::StreamClosed);
        }
        self.sender
            .as_ref()
            .ok_or(ConstraintError::StreamClosed)?
            .send(Box::new(job))
            .map_err(|_| ConstraintError::StreamClosed)
    }

    /// Event marked when all work queued so far has completed.
    pub fn record_event(&self) -> Result<GpuEvent> {
        let event = GpuEvent::new();
        let marker = MarkOnDrop(event.clone());
        self.enqueue(move || drop(marker))?;
        Ok(event)
    }

    /// Make later work on this stream wait for `event`.
    pub fn wait_for(&self, event: &GpuEvent) -> Result<()> {
        let event = event.clone();
        self.enqueue(move || event.wait())
    }

    /// Block the host until the stream is idle.
    pub fn synchronize(&self) -> Result<()> {
        self.record_event()?.wait();
        if self.failed.load(Ordering::SeqCst) {
            return Err(ConstraintError::StreamClosed);
        }
        Ok(())
    }
}

impl Drop for DeviceStream {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for DeviceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceStream").field("name", &self.name).finish()
    }
}

/// Creates streams; kernels run on the global rayon pool.
#[derive(Debug, Default)]
pub struct DeviceContext {
    streams_created: AtomicUsize,
}

impl DeviceContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of threads a kernel launch can spread blocks over.
    pub fn num_compute_units(&self) -> usize {
        rayon::current_num_threads()
    }

    pub fn create_stream(&self, name: &str) -> Result<DeviceStream> {
        let id = self.streams_created.fetch_add(1, Ordering::Relaxed);
        DeviceStream::spawn(format!("{name}-{id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_f32_accumulates_across_threads() {
        let value = AtomicF32::new(1.0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        value.fetch_add(0.5);
                    }
                });
            }
        });
        assert_eq!(value.load(), 2001.0);
    }

    #[test]
    fn test_buffer_growth_is_grow_only() {
        let mut buffer = DeviceBuffer::<f32>::new("lengths");
        buffer.reallocate(10);
        let capacity = buffer.capacity();
        assert!(capacity >= 10);
        assert_eq!(buffer.reallocations(), 1);
        buffer.reallocate(5);
        buffer.reallocate(capacity);
        assert_eq!(buffer.capacity(), capacity);
        assert_eq!(buffer.reallocations(), 1);
        assert_eq!(buffer.size(), capacity);
        buffer.reallocate(capacity + 1);
        assert_eq!(buffer.reallocations(), 2);
    }

    #[test]
    fn test_copies_round_trip_through_stream() {
        let context = DeviceContext::new();
        let stream = context.create_stream("test").unwrap();
        let mut buffer = DeviceBuffer::<AtomicF32>::new("xp");
        buffer.reallocate(4);
        buffer.copy_to_device(&stream, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(buffer.copy_from_device(&stream, 3).unwrap(), vec![1.0, 2.0, 3.0]);
        buffer.clear(&stream).unwrap();
        assert_eq!(buffer.copy_from_device(&stream, 4).unwrap(), vec![0.0; 4]);
    }

    #[test]
    fn test_oversized_transfers_are_rejected() {
        let context = DeviceContext::new();
        let stream = context.create_stream("test").unwrap();
        let mut buffer = DeviceBuffer::<i32>::new("counts");
        buffer.reallocate(2);
        let err = buffer.copy_to_device(&stream, vec![1, 2, 3]).unwrap_err();
        assert!(matches!(
            err,
            ConstraintError::DeviceBufferTooSmall { name: "counts", requested: 3, .. }
        ));
    }

    #[test]
    fn test_stream_runs_jobs_in_order() {
        let context = DeviceContext::new();
        let stream = context.create_stream("order").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for k in 0..16 {
            let log = Arc::clone(&log);
            stream.enqueue(move || log.lock().unwrap().push(k)).unwrap();
        }
        stream.synchronize().unwrap();
        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_events_order_work_across_streams() {
        let context = DeviceContext::new();
        let producer = context.create_stream("producer").unwrap();
        let consumer = context.create_stream("consumer").unwrap();
        let flag = Arc::new(AtomicBool::new(false));

        let gate = GpuEvent::new();
        let blocked = gate.clone();
        producer.enqueue(move || blocked.wait()).unwrap();
        let set = Arc::clone(&flag);
        producer.enqueue(move || set.store(true, Ordering::SeqCst)).unwrap();
        let done = producer.record_event().unwrap();
        assert!(!done.is_ready());

        consumer.wait_for(&done).unwrap();
        let seen = Arc::new(AtomicBool::new(false));
        let check = Arc::clone(&flag);
        let record = Arc::clone(&seen);
        consumer
            .enqueue(move || record.store(check.load(Ordering::SeqCst), Ordering::SeqCst))
            .unwrap();

        gate.mark();
        consumer.synchronize().unwrap();
        assert!(done.is_ready());
        assert!(seen.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panicking_job_closes_stream() {
        let context = DeviceContext::new();
        let stream = context.create_stream("faulty").unwrap();
        stream.enqueue(|| panic!("kernel fault")).unwrap();
        assert_eq!(stream.synchronize(), Err(ConstraintError::StreamClosed));
        assert_eq!(stream.enqueue(|| {}), Err(ConstraintError::StreamClosed));
    }
}

// Arena allocates memory for decoded message trees, freed all at once.
// Messages are short lived and created together, so batching small
// allocations into sporadic large chunk allocations wins. The arena is a
// non-generic type to avoid code bloat; callers keep control over the
// backing allocator because chunks are large enough that going through a
// `dyn Allocator` costs nothing per object.

use core::alloc::Layout;
use core::any::Any;
use core::ptr::NonNull;

use allocator_api2::alloc::Allocator;

/// Chunks are powers of two, never smaller than this.
const MIN_CHUNK: usize = 64;

/// All allocations are served in pointer-aligned units.
const UNIT: usize = core::mem::align_of::<usize>();

struct Chunk {
    ptr: NonNull<u8>,
    /// Chunk size; always a power of two, so this doubles as the log2 index.
    size: usize,
}

pub struct Arena<'a> {
    next: *mut u8,
    end: *mut u8,
    /// Size of the current (largest) chunk.
    cap: usize,
    chunks: Vec<Chunk>,
    /// Opaque roots that must outlive everything allocated here.
    keep: Vec<Box<dyn Any>>,
    allocator: &'a dyn Allocator,
}

impl<'a> Arena<'a> {
    pub fn new(allocator: &'a dyn Allocator) -> Self {
        Arena {
            next: core::ptr::null_mut(),
            end: core::ptr::null_mut(),
            cap: 0,
            chunks: Vec::new(),
            keep: Vec::new(),
            allocator,
        }
    }

    /// Allocate `size` pointer-aligned bytes. The memory is uninitialized.
    ///
    /// Requests with alignment above pointer alignment are an invariant
    /// violation: the arena does not serve heterogeneously-aligned objects.
    #[inline]
    pub fn alloc_raw(&mut self, layout: Layout) -> NonNull<u8> {
        assert!(
            layout.align() <= UNIT,
            "arena cannot serve over-aligned allocations"
        );
        // Zero-sized requests still get a unique, non-null unit.
        let size = crate::util::align_up(layout.size().max(1), UNIT);
        let next = self.next;
        // next is always UNIT-aligned; end - next cannot underflow.
        let available = self.end as usize - next as usize;
        if crate::util::likely(available >= size) {
            self.next = unsafe { next.add(size) };
            return unsafe { NonNull::new_unchecked(next) };
        }
        self.alloc_outlined(size)
    }

    #[inline]
    pub fn alloc<T>(&mut self) -> NonNull<T> {
        self.alloc_raw(Layout::new::<T>()).cast()
    }

    /// Allocate and zero.
    pub fn alloc_zeroed(&mut self, size: usize) -> NonNull<u8> {
        let ptr = self.alloc_raw(
            Layout::from_size_align(size, UNIT).expect("allocation too large"),
        );
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, size) };
        ptr
    }

    /// Ensure `size` contiguous bytes can be bump-allocated without a new chunk.
    pub fn reserve(&mut self, size: usize) {
        let size = crate::util::align_up(size, UNIT);
        let available = self.end as usize - self.next as usize;
        if available < size {
            self.new_chunk(size);
        }
    }

    /// Grow the most recent allocation in place. Succeeds only when
    /// `ptr + old_size` is the bump cursor and the chunk has room; the cursor
    /// is then advanced without copying.
    #[inline]
    pub fn grow_in_place(&mut self, ptr: *mut u8, old_size: usize, new_size: usize) -> bool {
        let old = crate::util::align_up(old_size, UNIT);
        let new = crate::util::align_up(new_size, UNIT);
        unsafe {
            if ptr.add(old) != self.next {
                return false;
            }
            let grown = ptr.add(new);
            if grown > self.end {
                return false;
            }
            self.next = grown;
        }
        true
    }

    /// Root an opaque value for the arena's lifetime.
    pub fn keep_alive(&mut self, value: Box<dyn Any>) {
        self.keep.push(value);
    }

    /// Recycle: drop keep-alive roots and all chunks except the largest,
    /// which is rewound for reuse. Memory handed out earlier must no longer
    /// be referenced.
    pub fn free(&mut self) {
        self.keep.clear();
        let last = self.chunks.pop();
        for chunk in self.chunks.drain(..) {
            unsafe {
                self.allocator.deallocate(
                    chunk.ptr,
                    Layout::from_size_align_unchecked(chunk.size, UNIT),
                );
            }
        }
        match last {
            Some(chunk) => {
                self.next = chunk.ptr.as_ptr();
                self.end = unsafe { chunk.ptr.as_ptr().add(chunk.size) };
                self.cap = chunk.size;
                self.chunks.push(chunk);
            }
            None => {
                self.next = core::ptr::null_mut();
                self.end = core::ptr::null_mut();
                self.cap = 0;
            }
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.chunks.iter().map(|c| c.size).sum()
    }

    #[inline(never)]
    fn alloc_outlined(&mut self, size: usize) -> NonNull<u8> {
        self.new_chunk(size);
        let ptr = self.next;
        self.next = unsafe { ptr.add(size) };
        unsafe { NonNull::new_unchecked(ptr) }
    }

    fn new_chunk(&mut self, at_least: usize) {
        let want = at_least.max(self.cap * 2).max(MIN_CHUNK);
        let size = want.next_power_of_two();
        let layout = Layout::from_size_align(size, UNIT).expect("chunk layout");
        let ptr = self
            .allocator
            .allocate(layout)
            .expect("arena chunk allocation failed")
            .cast::<u8>();
        self.chunks.push(Chunk { ptr, size });
        self.next = ptr.as_ptr();
        self.end = unsafe { ptr.as_ptr().add(size) };
        self.cap = size;
    }
}

impl Drop for Arena<'_> {
    fn drop(&mut self) {
        for chunk in self.chunks.drain(..) {
            unsafe {
                self.allocator.deallocate(
                    chunk.ptr,
                    Layout::from_size_align_unchecked(chunk.size, UNIT),
                );
            }
        }
    }
}

// Safety: the arena hands out raw memory; it moves between threads only as a
// whole, and the allocator reference decides whether that is allowed.
unsafe impl<'a> Send for Arena<'a> where &'a dyn Allocator: Send {}

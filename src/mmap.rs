//! The single OS boundary of the crate: "give me `size` bytes aligned to
//! `align`". Everything else is carved out of these mappings.

#[cfg(unix)]
pub mod _unix {
    use std::io;
    use std::ptr::null_mut;

    pub struct Mmap {
        start: *mut u8,
        size: usize,
        align: usize,
    }

    impl Mmap {
        /// Reserve and commit `size` bytes aligned to `align` (a power of
        /// two). The OS hands the memory back zero-filled.
        pub fn new(size: usize, align: usize) -> io::Result<Self> {
            unsafe {
                let map = libc::mmap(
                    null_mut(),
                    (size + align) as _,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                );
                if map == libc::MAP_FAILED {
                    return Err(io::Error::last_os_error());
                }
                Ok(Self {
                    start: map as *mut u8,
                    size,
                    align,
                })
            }
        }

        /// Return an `align`ed pointer to the mmap'ed region. The aligned
        /// span of `size` bytes lies entirely inside the mapping.
        pub fn aligned(&self) -> *mut u8 {
            let offset = self.align - (self.start as usize) % self.align;
            unsafe { self.start.add(offset % self.align) }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }

        pub const fn size(&self) -> usize {
            self.size
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.start as *mut _, (self.size + self.align) as _);
            }
        }
    }
}

#[cfg(windows)]
pub mod _win {
    use std::io;
    use std::ptr::null_mut;

    use winapi::um::{
        memoryapi::{VirtualAlloc, VirtualFree},
        winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE},
    };

    pub struct Mmap {
        start: *mut u8,
        size: usize,
        align: usize,
    }

    impl Mmap {
        pub fn new(size: usize, align: usize) -> io::Result<Self> {
            unsafe {
                let mem = VirtualAlloc(
                    null_mut(),
                    size + align,
                    MEM_RESERVE | MEM_COMMIT,
                    PAGE_READWRITE,
                );
                if mem.is_null() {
                    return Err(io::Error::last_os_error());
                }
                Ok(Self {
                    start: mem as *mut u8,
                    size,
                    align,
                })
            }
        }

        /// Return an `align`ed pointer to the reserved region.
        pub fn aligned(&self) -> *mut u8 {
            let offset = self.align - (self.start as usize) % self.align;
            unsafe { self.start.add(offset % self.align) }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }

        pub const fn size(&self) -> usize {
            self.size
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            unsafe {
                VirtualFree(self.start.cast(), 0, MEM_RELEASE);
            }
        }
    }
}

#[cfg(unix)]
pub use _unix::*;
#[cfg(windows)]
pub use _win::*;

#[cfg(test)]
mod tests {
    use super::Mmap;
    use crate::is_aligned;

    #[test]
    fn mapping_is_aligned_and_zeroed() {
        let map = Mmap::new(64 * 1024, 64 * 1024).unwrap();
        let base = map.aligned();
        assert!(is_aligned(base as usize, 64 * 1024));
        unsafe {
            assert_eq!(*base, 0);
            assert_eq!(*base.add(64 * 1024 - 1), 0);
        }
    }
}

use std::time::Instant;

use once_cell::sync::Lazy;

pub struct FormattedSize {
    pub size: f64,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = self.size / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 8f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

impl std::fmt::Debug for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size: size as f64 }
}

/// `align` must be a power of two.
#[inline(always)]
pub const fn is_aligned(addr: usize, align: usize) -> bool {
    addr & align.wrapping_sub(1) == 0
}

/// rounds the given value `val` up to the nearest multiple
/// of `align`.
#[inline(always)]
pub const fn align_usize(value: usize, align: usize) -> usize {
    ((value.wrapping_add(align).wrapping_sub(1)).wrapping_div(align)).wrapping_mul(align)
}

#[inline]
pub const fn round_up_pow2(value: usize) -> usize {
    if value <= 1 {
        1
    } else {
        1 << (usize::BITS - (value - 1).leading_zeros())
    }
}

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic nanoseconds since the runtime was first touched.
///
/// Zero is never returned so it can be used as "not set" in atomics.
pub fn nanotime() -> u64 {
    PROCESS_START.elapsed().as_nanos() as u64 + 1
}

/// Busy-waits `cycles` rounds of the spin hint.
#[inline]
pub fn procyield(cycles: usize) {
    for _ in 0..cycles {
        std::hint::spin_loop();
    }
}

pub fn osyield() {
    std::thread::yield_now();
}

pub fn usleep(micros: u64) {
    std::thread::sleep(std::time::Duration::from_micros(micros));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment() {
        assert_eq!(align_usize(13, 8), 16);
        assert_eq!(align_usize(16, 8), 16);
        assert!(is_aligned(8192, 8192));
        assert!(!is_aligned(8192 + 8, 2048));
        assert_eq!(round_up_pow2(3000), 4096);
        assert_eq!(round_up_pow2(2048), 2048);
    }

    #[test]
    fn formatting() {
        assert_eq!(format!("{}", formatted_size(512)), "512B");
        assert_eq!(format!("{}", formatted_size(2048)), "2.0K");
        assert_eq!(format!("{}", formatted_size(3 * 1024 * 1024)), "3.0M");
    }

    #[test]
    fn monotonic() {
        let a = nanotime();
        let b = nanotime();
        assert!(a > 0 && b >= a);
    }
}

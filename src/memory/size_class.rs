//! Size classes for small objects.
//!
//! The table is built at start-up. Sizes grow by 8 bytes at first, then the
//! step is widened at every power of two (16 bytes from 16, size/8 from 128,
//! 256 bytes from 2 KiB). Each class gets the smallest number of pages whose
//! tail waste stays under 1/8, and neighbouring classes that would produce
//! the same number of objects on the same number of pages are merged.

use once_cell::sync::Lazy;

use super::{MAX_SMALL_SIZE, PAGE_SHIFT, PAGE_SIZE};

/// Expected number of classes, class 0 included.
pub const NUM_SIZE_CLASSES: usize = 67;

pub struct SizeClasses {
    class_to_size: Vec<usize>,
    class_to_npages: Vec<usize>,
    size_to_class8: Vec<u8>,
    size_to_class128: Vec<u8>,
}

pub static SIZE_CLASSES: Lazy<SizeClasses> = Lazy::new(SizeClasses::compute);

impl SizeClasses {
    fn compute() -> Self {
        let mut class_to_size = vec![0usize];
        let mut class_to_npages = vec![0usize];

        let mut align = 8;
        let mut size = align;
        while size <= MAX_SMALL_SIZE {
            if size & (size - 1) == 0 {
                if size >= 2048 {
                    align = 256;
                } else if size >= 128 {
                    align = size / 8;
                } else if size >= 16 {
                    align = 16;
                }
            }
            debug_assert!(align & (align - 1) == 0);

            let mut allocsize = PAGE_SIZE;
            while allocsize % size > allocsize / 8 {
                allocsize += PAGE_SIZE;
            }
            let npages = allocsize >> PAGE_SHIFT;

            let last = class_to_size.len() - 1;
            if last > 0
                && npages == class_to_npages[last]
                && allocsize / size == allocsize / class_to_size[last]
            {
                class_to_size[last] = size;
            } else {
                class_to_npages.push(npages);
                class_to_size.push(size);
            }
            size += align;
        }

        let mut size_to_class8 = vec![0u8; 1024 / 8 + 1];
        let mut size_to_class128 = vec![0u8; (MAX_SMALL_SIZE - 1024) / 128 + 1];
        let mut nextsize = 0;
        for class in 1..class_to_size.len() {
            while nextsize < 1024 && nextsize <= class_to_size[class] {
                size_to_class8[nextsize / 8] = class as u8;
                nextsize += 8;
            }
            if nextsize >= 1024 {
                while nextsize <= class_to_size[class] {
                    size_to_class128[(nextsize - 1024) / 128] = class as u8;
                    nextsize += 128;
                }
            }
        }

        if class_to_size.len() != NUM_SIZE_CLASSES {
            log::warn!(
                target: "heap",
                "size class table has {} classes, expected {}",
                class_to_size.len(),
                NUM_SIZE_CLASSES
            );
        }

        Self {
            class_to_size,
            class_to_npages,
            size_to_class8,
            size_to_class128,
        }
    }

    /// Number of classes including the large-object class 0.
    pub fn num_classes(&self) -> usize {
        self.class_to_size.len()
    }

    /// Class for an allocation of `size` bytes; `size` must be in
    /// `1..=MAX_SMALL_SIZE`.
    #[inline]
    pub fn size_to_class(&self, size: usize) -> usize {
        debug_assert!(size > 0 && size <= MAX_SMALL_SIZE);
        if size <= 1024 - 8 {
            self.size_to_class8[(size + 7) >> 3] as usize
        } else {
            self.size_to_class128[(size - 1024 + 127) >> 7] as usize
        }
    }

    #[inline]
    pub fn class_size(&self, class: usize) -> usize {
        self.class_to_size[class]
    }

    #[inline]
    pub fn class_npages(&self, class: usize) -> usize {
        self.class_to_npages[class]
    }

    /// Objects per span of `class`.
    pub fn class_objects(&self, class: usize) -> usize {
        (self.class_to_npages[class] << PAGE_SHIFT) / self.class_to_size[class]
    }
}

pub fn size_to_class(size: usize) -> usize {
    SIZE_CLASSES.size_to_class(size)
}

pub fn class_size(class: usize) -> usize {
    SIZE_CLASSES.class_size(class)
}

pub fn class_npages(class: usize) -> usize {
    SIZE_CLASSES.class_npages(class)
}

pub fn class_objects(class: usize) -> usize {
    SIZE_CLASSES.class_objects(class)
}

pub fn num_classes() -> usize {
    SIZE_CLASSES.num_classes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_shape() {
        let t = &*SIZE_CLASSES;
        assert_eq!(t.num_classes(), NUM_SIZE_CLASSES);
        assert_eq!(t.class_size(1), 8);
        assert_eq!(t.class_size(t.num_classes() - 1), MAX_SMALL_SIZE);
        for c in 2..t.num_classes() {
            assert!(t.class_size(c) > t.class_size(c - 1));
        }
    }

    #[test]
    fn every_size_fits_its_class() {
        let t = &*SIZE_CLASSES;
        for size in 1..=MAX_SMALL_SIZE {
            let c = t.size_to_class(size);
            assert!(c > 0, "size {} has no class", size);
            assert!(t.class_size(c) >= size);
            assert!(c == 1 || t.class_size(c - 1) < size, "size {} not in tightest class", size);
        }
    }

    #[test]
    fn tail_waste_is_bounded() {
        let t = &*SIZE_CLASSES;
        for c in 1..t.num_classes() {
            let span = t.class_npages(c) * PAGE_SIZE;
            assert!(span % t.class_size(c) <= span / 8);
            assert!(t.class_objects(c) >= 1);
        }
    }
}

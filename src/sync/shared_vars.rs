use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, Ordering};

pub type SharedValue = AtomicU8;

/// Boolean flag shared between mutators and the collector. Stores are
/// sequentially consistent: the collector flips these while tasks run.
pub struct SharedFlag(SharedValue);

impl SharedFlag {
    pub const fn new() -> Self {
        Self(SharedValue::new(0))
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire) == 1
    }

    pub fn set_cond(&self, c: bool) {
        self.0.store(c as u8, Ordering::SeqCst);
    }
}

impl Default for SharedFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Fieldless enum that fits in a [`SharedValue`].
pub trait SharedEnum: Copy {
    fn to_raw(self) -> u8;
    fn from_raw(raw: u8) -> Self;
}

/// Enum value shared between mutators and the collector.
pub struct SharedEnumFlag<E> {
    value: SharedValue,
    marker: PhantomData<E>,
}

impl<E: SharedEnum> SharedEnumFlag<E> {
    pub fn new(val: E) -> Self {
        Self {
            value: SharedValue::new(val.to_raw()),
            marker: PhantomData,
        }
    }

    #[inline]
    pub fn get(&self) -> E {
        E::from_raw(self.value.load(Ordering::Acquire))
    }

    /// Stores `val` and returns the previous value.
    pub fn replace(&self, val: E) -> E {
        E::from_raw(self.value.swap(val.to_raw(), Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, PartialEq, Debug)]
    enum Light {
        Red,
        Green,
    }

    impl SharedEnum for Light {
        fn to_raw(self) -> u8 {
            self as u8
        }

        fn from_raw(raw: u8) -> Self {
            if raw == 1 {
                Light::Green
            } else {
                Light::Red
            }
        }
    }

    #[test]
    fn flag_follows_condition() {
        let f = SharedFlag::new();
        assert!(!f.is_set());
        f.set_cond(true);
        assert!(f.is_set());
        f.set_cond(false);
        assert!(!f.is_set());
    }

    #[test]
    fn enum_flag_replaces() {
        let f = SharedEnumFlag::new(Light::Red);
        assert_eq!(f.replace(Light::Green), Light::Red);
        assert_eq!(f.get(), Light::Green);
    }
}

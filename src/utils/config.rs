//! Bounded configuration values.
//!
//! Every tunable of the resolution core has a default and a range it is
//! silently clamped into. [`DefMinMax`] keeps the three together so the
//! setters on the configuration types stay one-liners.

use std::cmp;

//------------ DefMinMax -----------------------------------------------------

/// The default, minimum, and maximum values for a config variable.
#[derive(Clone, Copy, Debug)]
pub struct DefMinMax<T> {
    /// The default value,
    def: T,

    /// The minimum value,
    min: T,

    /// The maximum value,
    max: T,
}

impl<T> DefMinMax<T> {
    /// Creates a new value.
    pub const fn new(def: T, min: T, max: T) -> Self {
        Self { def, min, max }
    }

    /// Returns the default value.
    pub fn default(self) -> T {
        self.def
    }

    /// Returns the smallest accepted value.
    pub fn min(self) -> T {
        self.min
    }

    /// Returns the largest accepted value.
    pub fn max(self) -> T {
        self.max
    }

    /// Trims the given value to fit into the minimum/maximum range.
    pub fn limit(self, value: T) -> T
    where
        T: Ord,
    {
        cmp::max(self.min, cmp::min(self.max, value))
    }
}

//============ Tests =========================================================

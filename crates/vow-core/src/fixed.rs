//! Fixed-point depth/progress counter.
//!
//! A promise carries a single `u32` split into a whole part and a fractional
//! part. The whole part counts how many chained promises deep the node sits
//! in its tree (root = 0); the fractional part is its own normalized progress
//! toward completing one unit of depth.
//!
//! ## Bit layout
//!
//! With `bits` fractional bits (`FixedScale::new(bits)`):
//!
//! ```text
//! | 32 - bits whole bits | bits fractional bits |
//! ```
//!
//! Max whole value: `2^(32 - bits)`, precision `1 / 2^bits`.
//!
//! Whole-part increments are overflow-checked unconditionally; a wrap there
//! means the pooling/depth discipline is broken. Fractional deltas use
//! wrapping arithmetic on purpose: re-reporting a lower progress value
//! produces a wrapped negative delta that cancels out at the accumulator.

/// Raw fixed-point value. All interpretation goes through a [`FixedScale`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Fixed32(u32);

impl Fixed32 {
    pub const ZERO: Fixed32 = Fixed32(0);

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn from_raw(raw: u32) -> Self {
        Fixed32(raw)
    }

    /// Add a (possibly wrapped-negative) fractional delta.
    pub fn increment(&mut self, amount: u32) {
        self.0 = self.0.wrapping_add(amount);
    }
}

/// Interprets [`Fixed32`] values for a configured number of fractional bits.
#[derive(Debug, Clone, Copy)]
pub struct FixedScale {
    bits: u32,
}

impl FixedScale {
    /// `bits` must be in `1..=31` so both parts are non-empty.
    pub fn new(bits: u32) -> Option<Self> {
        (1..=31).contains(&bits).then_some(Self { bits })
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// One whole unit in fractional units.
    pub fn decimal_max(&self) -> u32 {
        1u32 << self.bits
    }

    fn decimal_mask(&self) -> u32 {
        self.decimal_max() - 1
    }

    fn whole_mask(&self) -> u32 {
        !self.decimal_mask()
    }

    pub fn from_whole(&self, whole: u32) -> Fixed32 {
        assert!(
            whole <= u32::MAX >> self.bits,
            "promise depth overflows the fixed-point whole part"
        );
        Fixed32(whole << self.bits)
    }

    /// Truncating conversion; never rounds up, so a fraction just below 1.0
    /// cannot alias a whole unit.
    pub fn from_fraction(&self, fraction: f64) -> Fixed32 {
        Fixed32((fraction * f64::from(self.decimal_max())) as u32)
    }

    pub fn whole(&self, v: Fixed32) -> u32 {
        v.0 >> self.bits
    }

    pub fn fraction_units(&self, v: Fixed32) -> u32 {
        v.0 & self.decimal_mask()
    }

    pub fn to_f64(&self, v: Fixed32) -> f64 {
        f64::from(self.whole(v))
            + f64::from(self.fraction_units(v)) / f64::from(self.decimal_max())
    }

    /// Replace the fractional part, keeping the whole part, and return the
    /// (wrapping) difference from the old fraction in fractional units. The
    /// new fraction saturates just below one whole; a full unit only ever
    /// arrives through resolution.
    pub fn assign_fraction(&self, v: &mut Fixed32, fraction: f64) -> u32 {
        let old = self.fraction_units(*v);
        let new = ((fraction * f64::from(self.decimal_max())) as u32).min(self.decimal_max() - 1);
        v.0 = (v.0 & self.whole_mask()) | new;
        new.wrapping_sub(old)
    }

    /// Fractional units remaining until the next whole value.
    pub fn to_next_whole(&self, v: Fixed32) -> u32 {
        self.decimal_max() - self.fraction_units(v)
    }

    /// Next whole value with the fraction truncated away. Checked: depth
    /// growth past the whole-part capacity is an invariant violation.
    pub fn incremented_whole(&self, v: Fixed32) -> Fixed32 {
        let whole = (v.0 & self.whole_mask())
            .checked_add(self.decimal_max())
            .expect("promise depth overflows the fixed-point whole part");
        Fixed32(whole)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_and_fraction_split() {
        let s = FixedScale::new(13).unwrap();
        let v = s.from_whole(3);
        assert_eq!(s.whole(v), 3);
        assert_eq!(s.fraction_units(v), 0);
        assert_eq!(s.to_f64(v), 3.0);
    }

    #[test]
    fn test_assign_fraction_returns_delta() {
        let s = FixedScale::new(13).unwrap();
        let mut v = s.from_whole(1);
        let d1 = s.assign_fraction(&mut v, 0.5);
        assert_eq!(d1, s.decimal_max() / 2);
        assert_eq!(s.whole(v), 1);

        // Lower re-report wraps; adding the delta to an accumulator that saw
        // d1 lands back at 0.25.
        let d2 = s.assign_fraction(&mut v, 0.25);
        let mut acc = Fixed32::ZERO;
        acc.increment(d1);
        acc.increment(d2);
        assert_eq!(s.fraction_units(acc), s.decimal_max() / 4);
    }

    #[test]
    fn test_to_next_whole() {
        let s = FixedScale::new(13).unwrap();
        let mut v = Fixed32::ZERO;
        s.assign_fraction(&mut v, 0.5);
        assert_eq!(s.to_next_whole(v), s.decimal_max() / 2);
        assert_eq!(s.to_next_whole(Fixed32::ZERO), s.decimal_max());
    }

    #[test]
    fn test_incremented_whole_truncates_fraction() {
        let s = FixedScale::new(13).unwrap();
        let mut v = s.from_whole(2);
        s.assign_fraction(&mut v, 0.9);
        let next = s.incremented_whole(v);
        assert_eq!(s.whole(next), 3);
        assert_eq!(s.fraction_units(next), 0);
    }

    #[test]
    #[should_panic(expected = "overflows")]
    fn test_whole_overflow_is_loud() {
        let s = FixedScale::new(13).unwrap();
        let v = s.from_whole(u32::MAX >> 13);
        let _ = s.incremented_whole(v);
    }

    #[test]
    fn test_scale_bounds() {
        assert!(FixedScale::new(0).is_none());
        assert!(FixedScale::new(32).is_none());
        assert!(FixedScale::new(31).is_some());
    }
}

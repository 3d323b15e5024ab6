// index.rs — Index types with out-of-bounds policies
//
// Integer index types carry a bound `N` (0 = use the container's length) and
// a policy that maps any integer onto a valid slot. Float index types scale a
// fractional position onto an integer base index; `Lerp` and `Hermite` read
// interpolated values from a slice through them.
//
// Preconditions: none.
// Postconditions: every policy except `Unsafe` yields a slot in `[0, limit)`.
// Failure modes: `Wrapped<N, false>` rejects negative input with `IndexError`.
//                `Unsafe` out of range panics on slice access.
// Side effects: none.

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Add, AddAssign, Sub, SubAssign};

// ── Policy arithmetic ────────────────────────────────────────────────────

/// Wrap `value` into `[0, limit)`. Negative values wrap from the top.
pub fn wrap(value: i32, limit: i32) -> i32 {
    if limit <= 0 {
        return 0;
    }
    value.rem_euclid(limit)
}

/// Saturate `value` into `[0, limit - 1]`.
pub fn clamp(value: i32, limit: i32) -> i32 {
    if limit <= 0 {
        return 0;
    }
    value.clamp(0, limit - 1)
}

/// Loop `value` inside `[start, start + length)`.
///
/// Values below `start` pass through unchanged (saturated at 0). A zero
/// `length` loops over the remaining container. Without any loop range the
/// result is the plain `wrap`.
pub fn loop_within(value: i32, range: LoopRange, limit: i32) -> i32 {
    if range.is_unset() {
        return wrap(value, limit);
    }
    if value < range.start {
        return value.max(0);
    }
    let length = if range.length != 0 {
        range.length
    } else {
        (limit - range.start).max(1)
    };
    wrap(value - range.start, length) + range.start
}

/// A runtime-settable loop window for `Looped`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopRange {
    pub start: i32,
    pub length: i32,
}

impl LoopRange {
    /// Build the window `[lo, hi)`. An inverted pair is normalised.
    pub fn new(lo: i32, hi: i32) -> Self {
        let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
        Self {
            start: lo.max(0),
            length: hi - lo.max(0),
        }
    }

    pub fn is_unset(&self) -> bool {
        self.start == 0 && self.length == 0
    }
}

// ── Policy kind ──────────────────────────────────────────────────────────

/// Out-of-bounds behaviour of an integer index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Policy {
    Unsafe,
    Wrapped { allow_negative: bool },
    Clamped,
    Looped,
}

impl Policy {
    /// Map `value` onto a slot for a container of `limit` elements.
    pub fn apply(self, value: i32, limit: i32, range: LoopRange) -> Result<i32, IndexError> {
        match self {
            Policy::Unsafe => Ok(value),
            Policy::Wrapped {
                allow_negative: false,
            } if value < 0 => Err(IndexError::Negative(value)),
            Policy::Wrapped { .. } => Ok(wrap(value, limit)),
            Policy::Clamped => Ok(clamp(value, limit)),
            Policy::Looped => Ok(loop_within(value, range, limit)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Policy::Unsafe => "unsafe",
            Policy::Wrapped { .. } => "wrapped",
            Policy::Clamped => "clamped",
            Policy::Looped => "looped",
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────

/// Index construction failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    /// A negative value reached an index that forbids negative input.
    Negative(i32),
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexError::Negative(v) => write!(f, "negative index {} for non-negative wrap", v),
        }
    }
}

impl std::error::Error for IndexError {}

// ── Index traits ─────────────────────────────────────────────────────────

/// A type-level integer policy with a static bound.
pub trait IndexPolicy {
    /// Static bound, 0 when the index adapts to the container length.
    const BOUND: usize;

    /// Map a raw integer onto a slot of a container holding `len` elements.
    fn apply(raw: i32, len: usize) -> usize;

    /// Effective limit for a container of `len` elements.
    fn limit(len: usize) -> usize {
        if Self::BOUND == 0 {
            len
        } else {
            Self::BOUND
        }
    }
}

/// Anything that resolves to a slot of a container.
pub trait Index {
    fn resolve(&self, len: usize) -> usize;
}

impl Index for usize {
    fn resolve(&self, _len: usize) -> usize {
        *self
    }
}

struct StaticBound<const N: usize>;

impl<const N: usize> StaticBound<N> {
    const NONZERO: () = assert!(N > 0, "native index conversion needs a static bound");
}

fn to_slot(raw: i32) -> usize {
    usize::try_from(raw).unwrap_or(usize::MAX)
}

// ── Integer index types ──────────────────────────────────────────────────

/// No bounds enforcement. Out-of-range access panics at the slice boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Unsafe<const N: usize> {
    value: i32,
}

/// Modulo-`N` index. With `ALLOW_NEGATIVE = false` negative input is rejected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Wrapped<const N: usize, const ALLOW_NEGATIVE: bool = true> {
    value: i32,
}

/// Saturating index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Clamped<const N: usize> {
    value: i32,
}

/// Wrapping index over a runtime-settable sub-range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Looped<const N: usize> {
    value: i32,
    range: LoopRange,
}

impl<const N: usize> IndexPolicy for Unsafe<N> {
    const BOUND: usize = N;

    fn apply(raw: i32, _len: usize) -> usize {
        to_slot(raw)
    }
}

impl<const N: usize, const ALLOW_NEGATIVE: bool> IndexPolicy for Wrapped<N, ALLOW_NEGATIVE> {
    const BOUND: usize = N;

    fn apply(raw: i32, len: usize) -> usize {
        to_slot(wrap(raw, Self::limit(len) as i32))
    }
}

impl<const N: usize> IndexPolicy for Clamped<N> {
    const BOUND: usize = N;

    fn apply(raw: i32, len: usize) -> usize {
        to_slot(clamp(raw, Self::limit(len) as i32))
    }
}

impl<const N: usize> IndexPolicy for Looped<N> {
    const BOUND: usize = N;

    fn apply(raw: i32, len: usize) -> usize {
        to_slot(wrap(raw, Self::limit(len) as i32))
    }
}

macro_rules! integer_index {
    ($name:ident) => {
        impl<const N: usize> $name<N> {
            pub fn new(value: i32) -> Self {
                Self {
                    value,
                    ..Default::default()
                }
            }
        }
        integer_index!(@read $name [const N: usize] [N]);
        integer_index!(@ops $name [const N: usize] [N]);
    };
    (@read $name:ident [$($gen:tt)*] [$($arg:tt)*]) => {
        impl<$($gen)*> $name<$($arg)*> {
            /// The raw integer before the policy is applied.
            pub fn raw(&self) -> i32 {
                self.value
            }

            /// The slot inside the static bound.
            pub fn native(&self) -> usize {
                #[allow(clippy::let_unit_value)]
                let () = StaticBound::<N>::NONZERO;
                self.resolve(N)
            }
        }
    };
    (@ops $name:ident [$($gen:tt)*] [$($arg:tt)*]) => {
        impl<$($gen)*> $name<$($arg)*> {
            pub fn set(&mut self, value: i32) {
                self.value = value;
            }

            pub fn increment(&mut self) -> Self {
                self.value += 1;
                *self
            }

            pub fn decrement(&mut self) -> Self {
                self.value -= 1;
                *self
            }
        }

        impl<$($gen)*> Add<i32> for $name<$($arg)*> {
            type Output = Self;

            fn add(mut self, delta: i32) -> Self {
                self.value += delta;
                self
            }
        }

        impl<$($gen)*> Sub<i32> for $name<$($arg)*> {
            type Output = Self;

            fn sub(mut self, delta: i32) -> Self {
                self.value -= delta;
                self
            }
        }

        impl<$($gen)*> AddAssign<i32> for $name<$($arg)*> {
            fn add_assign(&mut self, delta: i32) {
                self.value += delta;
            }
        }

        impl<$($gen)*> SubAssign<i32> for $name<$($arg)*> {
            fn sub_assign(&mut self, delta: i32) {
                self.value -= delta;
            }
        }
    };
}

integer_index!(Unsafe);
integer_index!(Clamped);
integer_index!(Looped);
integer_index!(@read Wrapped [const N: usize, const ALLOW_NEGATIVE: bool] [N, ALLOW_NEGATIVE]);
integer_index!(@ops Wrapped [const N: usize] [N, true]);

impl<const N: usize> Wrapped<N, true> {
    pub fn new(value: i32) -> Self {
        Self { value }
    }
}

/// A non-negative wrap. Every mutation is checked, so a value below zero
/// never reaches `resolve`.
impl<const N: usize> Wrapped<N, false> {
    pub fn try_new(value: i32) -> Result<Self, IndexError> {
        if value < 0 {
            return Err(IndexError::Negative(value));
        }
        Ok(Self { value })
    }

    pub fn try_set(&mut self, value: i32) -> Result<(), IndexError> {
        *self = Self::try_new(value)?;
        Ok(())
    }

    pub fn increment(&mut self) -> Self {
        self.value = self.value.saturating_add(1);
        *self
    }

    pub fn try_decrement(&mut self) -> Result<Self, IndexError> {
        self.try_set(self.value - 1)?;
        Ok(*self)
    }

    /// `self + delta`, rejected when the sum is negative.
    pub fn checked_add(self, delta: i32) -> Result<Self, IndexError> {
        Self::try_new(self.value.saturating_add(delta))
    }

    pub fn checked_sub(self, delta: i32) -> Result<Self, IndexError> {
        Self::try_new(self.value.saturating_sub(delta))
    }
}

impl<const N: usize> Looped<N> {
    /// Restrict looping to `[lo, hi)`.
    pub fn set_loop_range(&mut self, lo: i32, hi: i32) {
        self.range = LoopRange::new(lo, hi);
    }

    pub fn loop_range(&self) -> LoopRange {
        self.range
    }
}

impl<const N: usize> Index for Unsafe<N> {
    fn resolve(&self, len: usize) -> usize {
        Self::apply(self.value, len)
    }
}

impl<const N: usize, const ALLOW_NEGATIVE: bool> Index for Wrapped<N, ALLOW_NEGATIVE> {
    fn resolve(&self, len: usize) -> usize {
        Self::apply(self.value, len)
    }
}

impl<const N: usize> Index for Clamped<N> {
    fn resolve(&self, len: usize) -> usize {
        Self::apply(self.value, len)
    }
}

impl<const N: usize> Index for Looped<N> {
    fn resolve(&self, len: usize) -> usize {
        to_slot(loop_within(self.value, self.range, Self::limit(len) as i32))
    }
}

// ── Float index types ────────────────────────────────────────────────────

/// A fractional position that maps onto a base integer policy.
pub trait FloatIndex {
    /// Position in element units for a container of `len` elements.
    fn position(&self, len: usize) -> f64;

    /// Slot of the neighbour `delta` steps away from the integer part.
    fn slot(&self, len: usize, delta: i32) -> usize;

    /// Fractional weight between the integer part and its successor.
    fn alpha(&self, len: usize) -> f64 {
        let p = self.position(len);
        p - p.floor()
    }
}

/// A value in `[0, 1)` scaled by the base bound.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Normalised<B> {
    value: f64,
    base: PhantomData<B>,
}

/// A value already expressed in element units.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Unscaled<B> {
    value: f64,
    base: PhantomData<B>,
}

macro_rules! float_index {
    ($name:ident, |$v:ident, $limit:ident| $pos:expr) => {
        impl<B: IndexPolicy> $name<B> {
            pub fn new(value: impl Into<f64>) -> Self {
                Self {
                    value: value.into(),
                    base: PhantomData,
                }
            }

            pub fn set(&mut self, value: impl Into<f64>) {
                self.value = value.into();
            }

            pub fn raw(&self) -> f64 {
                self.value
            }
        }

        impl<B: IndexPolicy> FloatIndex for $name<B> {
            fn position(&self, len: usize) -> f64 {
                let $v = self.value;
                let $limit = B::limit(len).max(1) as f64;
                $pos
            }

            fn slot(&self, len: usize, delta: i32) -> usize {
                let base = self.position(len).floor() as i32;
                B::apply(base + delta, B::limit(len).max(1))
            }
        }

        impl<B: IndexPolicy> Index for $name<B> {
            fn resolve(&self, len: usize) -> usize {
                self.slot(len, 0)
            }
        }
    };
}

float_index!(Normalised, |v, limit| v * limit);
float_index!(Unscaled, |v, _limit| v);

// ── Interpolators ────────────────────────────────────────────────────────

/// Element types that can be interpolated.
pub trait Sample: Copy {
    fn to_f64(self) -> f64;
    fn from_f64(v: f64) -> Self;
}

impl Sample for f32 {
    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl Sample for f64 {
    fn to_f64(self) -> f64 {
        self
    }

    fn from_f64(v: f64) -> Self {
        v
    }
}

/// Reads a value between neighbouring slots.
pub trait Interpolator {
    fn read<T: Sample>(&self, data: &[T]) -> T;
}

/// Linear interpolation between `x0` and its successor.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Lerp<F> {
    pub index: F,
}

/// Four-point cubic (Hermite) interpolation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Hermite<F> {
    pub index: F,
}

impl<F: FloatIndex> Lerp<F> {
    pub fn new(index: F) -> Self {
        Self { index }
    }
}

impl<F: FloatIndex> Hermite<F> {
    pub fn new(index: F) -> Self {
        Self { index }
    }
}

pub fn lerp(x0: f64, x1: f64, alpha: f64) -> f64 {
    x0 + (x1 - x0) * alpha
}

pub fn hermite(x0: f64, x1: f64, x2: f64, x3: f64, alpha: f64) -> f64 {
    let a = (3.0 * (x1 - x2) - x0 + x3) * 0.5;
    let b = x2 + x2 + x0 - (5.0 * x1 + x3) * 0.5;
    let c = (x2 - x0) * 0.5;
    ((a * alpha + b) * alpha + c) * alpha + x1
}

impl<F: FloatIndex> Interpolator for Lerp<F> {
    fn read<T: Sample>(&self, data: &[T]) -> T {
        let len = data.len();
        let x0 = data[self.index.slot(len, 0)].to_f64();
        let x1 = data[self.index.slot(len, 1)].to_f64();
        T::from_f64(lerp(x0, x1, self.index.alpha(len)))
    }
}

impl<F: FloatIndex> Interpolator for Hermite<F> {
    fn read<T: Sample>(&self, data: &[T]) -> T {
        let len = data.len();
        let at = |d| data[self.index.slot(len, d)].to_f64();
        T::from_f64(hermite(at(-1), at(0), at(1), at(2), self.index.alpha(len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_negative_wraps_from_top() {
        assert_eq!(Wrapped::<5>::new(-1).resolve(5), 4);
        assert_eq!(Wrapped::<5>::new(7).resolve(5), 2);
    }

    #[test]
    fn non_negative_wrap_rejects_negative() {
        assert_eq!(
            Wrapped::<4, false>::try_new(-2),
            Err(IndexError::Negative(-2))
        );
        assert_eq!(Wrapped::<4, false>::try_new(6).map(|i| i.native()), Ok(2));
    }

    #[test]
    fn non_negative_wrap_checks_every_step_down() {
        let i = Wrapped::<4, false>::try_new(0).unwrap();
        assert_eq!(i.checked_sub(1), Err(IndexError::Negative(-1)));
        assert_eq!(i.checked_add(-2), Err(IndexError::Negative(-2)));
        assert_eq!(i.checked_add(5).map(|i| i.native()), Ok(1));

        let mut j = i;
        assert_eq!(j.try_decrement(), Err(IndexError::Negative(-1)));
        assert_eq!(j.raw(), 0);
        assert_eq!(j.increment().native(), 1);
        assert_eq!(j.try_decrement().map(|i| i.raw()), Ok(0));
        assert_eq!(j.try_set(-3), Err(IndexError::Negative(-3)));
        assert_eq!(j.raw(), 0);
    }

    #[test]
    fn clamped_saturates() {
        assert_eq!(Clamped::<8>::new(12).native(), 7);
        assert_eq!(Clamped::<8>::new(-3).native(), 0);
    }

    #[test]
    fn dynamic_bound_uses_container_length() {
        assert_eq!(Wrapped::<0>::new(9).resolve(4), 1);
        assert_eq!(Clamped::<0>::new(9).resolve(4), 3);
    }

    #[test]
    fn looped_without_range_wraps() {
        assert_eq!(Looped::<6>::new(8).native(), 2);
    }

    #[test]
    fn looped_range_passes_below_start() {
        let mut i = Looped::<16>::new(2);
        i.set_loop_range(4, 8);
        assert_eq!(i.native(), 2);
        i.set(9);
        assert_eq!(i.native(), 5);
        i.set(4);
        assert_eq!(i.native(), 4);
    }

    #[test]
    fn increments_return_updated_index() {
        let mut i = Wrapped::<3>::new(2);
        assert_eq!(i.increment().native(), 0);
        assert_eq!((i + 4).native(), 1);
        i -= 5;
        assert_eq!(i.native(), 1);
    }

    #[test]
    fn normalised_scales_by_base_bound() {
        let i = Normalised::<Clamped<8>>::new(0.5);
        assert_eq!(i.resolve(8), 4);
        let j = Normalised::<Clamped<8>>::new(1.5);
        assert_eq!(j.resolve(8), 7);
    }

    #[test]
    fn lerp_reads_between_neighbours() {
        let data = [0.0f32, 1.0, 2.0, 3.0];
        let i = Lerp::new(Unscaled::<Wrapped<0>>::new(1.25));
        assert!((i.read(&data) - 1.25).abs() < 1e-6);
        let wrap_around = Lerp::new(Unscaled::<Wrapped<0>>::new(3.5));
        assert!((wrap_around.read(&data) - 1.5).abs() < 1e-6);
    }

    #[test]
    fn hermite_passes_through_samples() {
        let data = [0.0f64, 1.0, 4.0, 9.0, 16.0];
        let i = Hermite::new(Unscaled::<Clamped<0>>::new(2.0));
        assert_eq!(i.read(&data), 4.0);
    }
}

// container.rs — Fixed spans, dynamic views and SIMD lane views
//
// `Span<T, N>` owns its elements with value semantics. `Dyn<'a, T>` is a
// non-owning, rebindable view into a span or another view. `SimdView`
// reinterprets groups of four contiguous floats as lanes and exposes the
// trailing elements as a scalar remainder.
//
// Two views may alias the same memory through shared parents; the borrow
// checker rules out concurrent mutation through them.
//
// Preconditions: none.
// Postconditions: a view's `size()` equals the length of its last rebind.
// Failure modes: rebinding outside the source yields `ViewError`.
// Side effects: none.

use std::fmt;
use std::ops::{Deref, DerefMut};

use crate::index::{Index, Interpolator, Sample};

/// Number of floats in one SIMD lane group.
pub const LANE_WIDTH: usize = 4;

// ── Errors ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewError {
    /// `offset + len` exceeds the source length.
    OutOfRange {
        offset: usize,
        len: usize,
        available: usize,
    },
    /// An initializer list had the wrong number of elements.
    SizeMismatch { expected: usize, actual: usize },
}

impl fmt::Display for ViewError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewError::OutOfRange {
                offset,
                len,
                available,
            } => write!(
                f,
                "view [{}, {}) exceeds source of {} elements",
                offset,
                offset + len,
                available
            ),
            ViewError::SizeMismatch { expected, actual } => write!(
                f,
                "initialiser list size mismatch. Expected: {}, Actual: {}",
                expected, actual
            ),
        }
    }
}

impl std::error::Error for ViewError {}

fn check_range(offset: usize, len: usize, available: usize) -> Result<(), ViewError> {
    match offset.checked_add(len) {
        Some(end) if end <= available => Ok(()),
        _ => Err(ViewError::OutOfRange {
            offset,
            len,
            available,
        }),
    }
}

// ── Span ─────────────────────────────────────────────────────────────────

/// A fixed-size array with value semantics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Span<T, const N: usize>([T; N]);

impl<T: Default, const N: usize> Default for Span<T, N> {
    fn default() -> Self {
        Self(std::array::from_fn(|_| T::default()))
    }
}

impl<T, const N: usize> From<[T; N]> for Span<T, N> {
    fn from(values: [T; N]) -> Self {
        Self(values)
    }
}

impl<T, const N: usize> Span<T, N> {
    pub const SIZE: usize = N;

    /// Build from an initializer list of exactly `N` elements, or one element
    /// that is broadcast to every slot.
    pub fn from_list(values: &[T]) -> Result<Self, ViewError>
    where
        T: Clone,
    {
        match values.len() {
            n if n == N => Ok(Self(std::array::from_fn(|i| values[i].clone()))),
            1 => Ok(Self::splat(values[0].clone())),
            actual => Err(ViewError::SizeMismatch {
                expected: N,
                actual,
            }),
        }
    }

    pub fn splat(value: T) -> Self
    where
        T: Clone,
    {
        Self(std::array::from_fn(|_| value.clone()))
    }

    pub fn size(&self) -> usize {
        N
    }

    /// Element access through an index type.
    pub fn at<I: Index>(&self, index: I) -> &T {
        &self.0[index.resolve(N)]
    }

    pub fn at_mut<I: Index>(&mut self, index: I) -> &mut T {
        &mut self.0[index.resolve(N)]
    }

    /// Interpolated read through `lerp`/`hermite` index types.
    pub fn interpolate<I: Interpolator>(&self, index: &I) -> T
    where
        T: Sample,
    {
        index.read(&self.0)
    }

    /// A view over the whole span.
    pub fn as_dyn(&mut self) -> Dyn<'_, T> {
        Dyn { data: &mut self.0 }
    }

    pub fn into_inner(self) -> [T; N] {
        self.0
    }
}

impl<const N: usize> Span<f32, N> {
    pub fn to_simd(&mut self) -> SimdView<'_> {
        SimdView { data: &mut self.0 }
    }
}

impl<T, const N: usize> Deref for Span<T, N> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.0
    }
}

impl<T, const N: usize> DerefMut for Span<T, N> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.0
    }
}

// ── Dyn ──────────────────────────────────────────────────────────────────

/// A bounds-tracked, non-owning view.
#[derive(Debug, Default)]
pub struct Dyn<'a, T> {
    data: &'a mut [T],
}

impl<'a, T> Dyn<'a, T> {
    pub fn new(data: &'a mut [T]) -> Self {
        Self { data }
    }

    /// Rebind to `len` elements of `source` starting at `offset`.
    pub fn refer_to(&mut self, source: &'a mut [T], len: usize, offset: usize) -> Result<(), ViewError> {
        check_range(offset, len, source.len())?;
        self.data = &mut source[offset..offset + len];
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn at<I: Index>(&self, index: I) -> &T {
        &self.data[index.resolve(self.data.len())]
    }

    pub fn at_mut<I: Index>(&mut self, index: I) -> &mut T {
        let len = self.data.len();
        &mut self.data[index.resolve(len)]
    }

    /// A narrower view that reborrows this one.
    pub fn slice(&mut self, offset: usize, len: usize) -> Result<Dyn<'_, T>, ViewError> {
        check_range(offset, len, self.data.len())?;
        Ok(Dyn {
            data: &mut self.data[offset..offset + len],
        })
    }

    /// Lane iteration needs 16-byte alignment and a multiple of four floats.
    pub fn is_simdable(&self) -> bool {
        std::mem::size_of::<T>() == std::mem::size_of::<f32>()
            && self.data.as_ptr() as usize % 16 == 0
            && self.data.len() % LANE_WIDTH == 0
    }

    pub fn into_slice(self) -> &'a mut [T] {
        self.data
    }
}

impl Dyn<'_, f32> {
    pub fn to_simd(&mut self) -> SimdView<'_> {
        SimdView {
            data: &mut *self.data,
        }
    }
}

impl<T> Deref for Dyn<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &*self.data
    }
}

impl<T> DerefMut for Dyn<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut *self.data
    }
}

/// A view aliasing `len` elements of `source` from `offset`.
pub fn slice<T>(source: &mut [T], offset: usize, len: usize) -> Result<Dyn<'_, T>, ViewError> {
    check_range(offset, len, source.len())?;
    Ok(Dyn {
        data: &mut source[offset..offset + len],
    })
}

// ── SIMD lanes ───────────────────────────────────────────────────────────

/// Groups of four floats plus a scalar remainder.
#[derive(Debug)]
pub struct SimdView<'a> {
    data: &'a mut [f32],
}

impl SimdView<'_> {
    pub fn num_lanes(&self) -> usize {
        self.data.len() / LANE_WIDTH
    }

    pub fn lanes_mut(&mut self) -> impl Iterator<Item = &mut [f32; LANE_WIDTH]> + '_ {
        self.data
            .chunks_exact_mut(LANE_WIDTH)
            .filter_map(|chunk| <&mut [f32; LANE_WIDTH]>::try_from(chunk).ok())
    }

    /// Elements after the last full lane group.
    pub fn remainder_mut(&mut self) -> &mut [f32] {
        let start = self.num_lanes() * LANE_WIDTH;
        &mut self.data[start..]
    }

    /// Multiply every element, lane-wise first, then the remainder.
    pub fn scale(&mut self, gain: f32) {
        for lane in self.lanes_mut() {
            for v in lane.iter_mut() {
                *v *= gain;
            }
        }
        for v in self.remainder_mut() {
            *v *= gain;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{Clamped, Lerp, Unscaled, Wrapped};

    #[test]
    fn wrapped_subscript_reads_modulo() {
        let d = Span::from([1, 2, 3, 4, 5]);
        assert_eq!(*d.at(Wrapped::<5>::new(7)), 3);
    }

    #[test]
    fn single_element_list_broadcasts() {
        let s = Span::<f32, 12>::from_list(&[90.0]).unwrap();
        assert!(s.iter().all(|v| *v == 90.0));
    }

    #[test]
    fn list_size_mismatch_reports_counts() {
        let err = Span::<i32, 3>::from_list(&[1, 2]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "initialiser list size mismatch. Expected: 3, Actual: 2"
        );
    }

    #[test]
    fn refer_to_tracks_length_and_offset() {
        let mut data = Span::from([0.0f32, 1.0, 2.0, 3.0, 4.0, 5.0]);
        let mut d = Dyn::default();
        d.refer_to(&mut data[..], 3, 2).unwrap();
        assert_eq!(d.size(), 3);
        assert_eq!(*d.at(0usize), 2.0);
        assert_eq!(*d.at(Clamped::<0>::new(10)), 4.0);
    }

    #[test]
    fn refer_to_out_of_range_fails() {
        let mut data = Span::<f32, 4>::default();
        let mut d = Dyn::default();
        assert!(d.refer_to(&mut data[..], 4, 1).is_err());
    }

    #[test]
    fn slice_aliases_source() {
        let mut data = Span::from([1.0f32; 8]);
        {
            let mut view = slice(&mut data[..], 2, 4).unwrap();
            *view.at_mut(0usize) = 7.0;
        }
        assert_eq!(data[2], 7.0);
    }

    #[test]
    fn simd_view_covers_remainder() {
        let mut data = Span::from([1.0f32; 10]);
        let mut lanes = data.to_simd();
        assert_eq!(lanes.num_lanes(), 2);
        assert_eq!(lanes.remainder_mut().len(), 2);
        lanes.scale(2.0);
        assert!(data.iter().all(|v| *v == 2.0));
    }

    #[test]
    fn interpolated_read() {
        let data = Span::from([0.0f32, 10.0, 20.0, 30.0]);
        let i = Lerp::new(Unscaled::<Wrapped<0>>::new(0.5));
        assert_eq!(data.interpolate(&i), 5.0);
    }
}

// poly.rs — Per-voice storage with a lock-free voice selector
//
// `PolyData<T, N>` pre-allocates `N` slots. The active voice is a single
// atomic integer that a control thread may swap while the audio thread reads.
//
// Preconditions: none.
// Postconditions: `get` returns the active voice, or voice 0 when none is set.
// Failure modes: none; out-of-range voice indices select no voice.
// Side effects: none.

use std::sync::atomic::{AtomicUsize, Ordering};

const NO_VOICE: usize = usize::MAX;

#[derive(Debug)]
pub struct PolyData<T, const N: usize> {
    voices: [T; N],
    current: AtomicUsize,
}

impl<T: Default, const N: usize> Default for PolyData<T, N> {
    fn default() -> Self {
        Self {
            voices: std::array::from_fn(|_| T::default()),
            current: AtomicUsize::new(NO_VOICE),
        }
    }
}

impl<T, const N: usize> PolyData<T, N> {
    pub fn from_voices(voices: [T; N]) -> Self {
        Self {
            voices,
            current: AtomicUsize::new(NO_VOICE),
        }
    }

    /// Select the active voice. `None` (or an out-of-range index) deselects.
    pub fn set_voice_index(&self, voice: Option<usize>) {
        let v = match voice {
            Some(v) if v < N => v,
            _ => NO_VOICE,
        };
        self.current.store(v, Ordering::Release);
    }

    pub fn voice_index(&self) -> Option<usize> {
        match self.current.load(Ordering::Acquire) {
            NO_VOICE => None,
            v => Some(v),
        }
    }

    pub fn get(&self) -> &T {
        &self.voices[self.voice_index().unwrap_or(0)]
    }

    pub fn get_mut(&mut self) -> &mut T {
        let v = self.voice_index().unwrap_or(0);
        &mut self.voices[v]
    }

    /// The active voice only, or every voice when none is active.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        match self.voice_index() {
            Some(v) => self.voices[v..v + 1].iter_mut(),
            None => self.voices.iter_mut(),
        }
    }

    pub fn all_voices_mut(&mut self) -> &mut [T; N] {
        &mut self.voices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iteration_follows_active_voice() {
        let mut p = PolyData::<i32, 4>::default();
        for v in p.iter_mut() {
            *v += 1;
        }
        assert_eq!(p.all_voices_mut(), &[1, 1, 1, 1]);

        p.set_voice_index(Some(2));
        for v in p.iter_mut() {
            *v += 10;
        }
        assert_eq!(*p.get(), 11);
        assert_eq!(p.all_voices_mut(), &[1, 1, 11, 1]);
    }

    #[test]
    fn out_of_range_voice_deselects() {
        let p = PolyData::<f32, 2>::default();
        p.set_voice_index(Some(5));
        assert_eq!(p.voice_index(), None);
    }
}

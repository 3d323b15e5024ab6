// node.rs — Processing node contract and callback payloads
//
// A node is any type implementing `Processor`. Channel counts are associated
// constants so that every composition checks them during monomorphization.
//
// Preconditions: `prepare` is called before the first `process`.
// Postconditions: none.
// Failure modes: channel disagreement is a compile-time error (const panic).
// Side effects: none on the processing path; no allocation, no locking.

use std::sync::Arc;

/// Upper bound on the channels of one frame.
pub const MAX_CHANNELS: usize = 16;

/// Processing configuration handed to `prepare`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrepareSpecs {
    pub sample_rate: f64,
    pub block_size: usize,
    pub num_channels: usize,
}

impl Default for PrepareSpecs {
    fn default() -> Self {
        Self {
            sample_rate: 44100.0,
            block_size: 512,
            num_channels: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    NoteOn,
    NoteOff,
    Controller,
    PitchBend,
    Empty,
}

/// A MIDI-like event with a sample-accurate timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HiseEvent {
    pub kind: EventType,
    pub channel: u8,
    pub value1: u8,
    pub value2: u8,
    pub timestamp: u32,
}

impl HiseEvent {
    pub fn note_on(channel: u8, note: u8, velocity: u8, timestamp: u32) -> Self {
        Self {
            kind: EventType::NoteOn,
            channel,
            value1: note,
            value2: velocity,
            timestamp,
        }
    }

    pub fn is_note_on(&self) -> bool {
        self.kind == EventType::NoteOn
    }

    pub fn is_note_off(&self) -> bool {
        self.kind == EventType::NoteOff
    }

    pub fn note_number(&self) -> u8 {
        self.value1
    }

    pub fn velocity(&self) -> u8 {
        self.value2
    }
}

/// A block of channel buffers plus the events inside it.
pub struct ProcessData<'a, 'b> {
    channels: &'a mut [&'b mut [f32]],
    events: &'a mut [HiseEvent],
}

impl<'a, 'b> ProcessData<'a, 'b> {
    pub fn new(channels: &'a mut [&'b mut [f32]], events: &'a mut [HiseEvent]) -> Self {
        Self { channels, events }
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn num_samples(&self) -> usize {
        self.channels.iter().map(|c| c.len()).min().unwrap_or(0)
    }

    pub fn channel_mut(&mut self, index: usize) -> Option<&mut [f32]> {
        self.channels.get_mut(index).map(|c| &mut **c)
    }

    pub fn events_mut(&mut self) -> &mut [HiseEvent] {
        &mut *self.events
    }

    /// Copy sample `s` of every channel into `frame`.
    pub fn read_frame(&self, s: usize, frame: &mut [f32]) {
        for (dst, ch) in frame.iter_mut().zip(self.channels.iter()) {
            *dst = ch[s];
        }
    }

    pub fn write_frame(&mut self, s: usize, frame: &[f32]) {
        for (src, ch) in frame.iter().zip(self.channels.iter_mut()) {
            ch[s] = *src;
        }
    }

    /// Run `f` once per frame, writing the frame back afterwards.
    pub fn for_each_frame(&mut self, mut f: impl FnMut(&mut [f32])) {
        let n = self.num_channels().min(MAX_CHANNELS);
        let mut frame = [0.0f32; MAX_CHANNELS];
        for s in 0..self.num_samples() {
            self.read_frame(s, &mut frame[..n]);
            f(&mut frame[..n]);
            self.write_frame(s, &frame[..n]);
        }
    }
}

/// The processing callback contract.
pub trait Processor {
    /// Fixed channel count, 0 for nodes that accept any layout.
    const NUM_CHANNELS: usize = 0;

    fn reset(&mut self);

    fn process_frame(&mut self, frame: &mut [f32]);

    fn prepare(&mut self, _specs: &PrepareSpecs) {}

    fn process(&mut self, data: &mut ProcessData<'_, '_>) {
        data.for_each_frame(|frame| self.process_frame(frame));
    }

    fn handle_event(&mut self, _event: &mut HiseEvent) {}

    fn set_parameter(&mut self, _index: usize, _value: f64) {}
}

/// Externally owned sample data (a table, slider pack or audio file) bound to
/// a node slot. Channels are stored planar; cloning shares the samples.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalData {
    samples: Arc<[f32]>,
    num_channels: usize,
}

impl ExternalData {
    /// `samples.len()` must be a multiple of `num_channels`.
    pub fn new(samples: impl Into<Arc<[f32]>>, num_channels: usize) -> Self {
        Self {
            samples: samples.into(),
            num_channels: num_channels.max(1),
        }
    }

    pub fn mono(samples: impl Into<Arc<[f32]>>) -> Self {
        Self::new(samples, 1)
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len() / self.num_channels
    }

    /// The samples of one channel, the native form of `referBlockTo`.
    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        let n = self.num_samples();
        (index < self.num_channels).then(|| &self.samples[index * n..(index + 1) * n])
    }
}

impl Default for ExternalData {
    fn default() -> Self {
        Self::mono(Vec::<f32>::new())
    }
}

/// A node that accepts external data bindings.
pub trait DataReceiver {
    fn set_external_data(&mut self, data: &ExternalData, slot: usize);
}

/// A node that exports an internal value as a modulation signal.
pub trait ModulationSource {
    /// The new modulation value, if one was produced since the last call.
    fn handle_modulation(&mut self) -> Option<f64>;
}

/// Agreed channel count of two nodes, where 0 means "any".
pub const fn agree_channels(a: usize, b: usize) -> usize {
    if a == 0 {
        b
    } else if b == 0 || a == b {
        a
    } else {
        panic!("channel count mismatch between composed nodes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Gain(f32);

    impl Processor for Gain {
        fn reset(&mut self) {}

        fn process_frame(&mut self, frame: &mut [f32]) {
            for v in frame {
                *v *= self.0;
            }
        }
    }

    #[test]
    fn default_process_walks_frames() {
        let mut left = [1.0f32; 4];
        let mut right = [2.0f32; 4];
        let mut channels: [&mut [f32]; 2] = [&mut left, &mut right];
        let mut events: [HiseEvent; 0] = [];
        let mut data = ProcessData::new(&mut channels, &mut events);
        Gain(0.5).process(&mut data);
        assert_eq!(left, [0.5; 4]);
        assert_eq!(right, [1.0; 4]);
    }

    #[test]
    fn external_data_is_planar() {
        let data = ExternalData::new(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], 2);
        assert_eq!(data.num_samples(), 3);
        assert_eq!(data.channel(1), Some(&[4.0f32, 5.0, 6.0][..]));
        assert_eq!(data.channel(2), None);
        assert_eq!(ExternalData::default().num_samples(), 0);
    }

    #[test]
    fn channel_agreement() {
        assert_eq!(agree_channels(0, 2), 2);
        assert_eq!(agree_channels(2, 0), 2);
        assert_eq!(agree_channels(1, 1), 1);
    }
}

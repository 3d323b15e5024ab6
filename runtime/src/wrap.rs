// wrap.rs — Node wrappers that change calling convention or add capability
//
// Each wrapper owns its inner node. `Unwrap` walks nested wrappers at the
// type level, so `wrapped_object()` resolves during monomorphization rather
// than through dynamic dispatch.
//
// Preconditions: none.
// Postconditions: all callbacks forward to the inner node.
// Failure modes: `Fix<C, N>` with a node pinned to a different channel count
//                fails to compile ("illegal channel wrap amount").
// Side effects: none; no allocation on any callback.

use crate::node::{
    DataReceiver, ExternalData, HiseEvent, ModulationSource, PrepareSpecs, ProcessData, Processor,
};
use crate::parameter::Parameter;

/// Recursive access to the innermost user node.
pub trait Unwrap {
    type Innermost;

    fn innermost(&self) -> &Self::Innermost;

    fn innermost_mut(&mut self) -> &mut Self::Innermost;
}

/// Declare user node types as the end of an unwrap chain.
#[macro_export]
macro_rules! leaf_node {
    ($($t:ty),+ $(,)?) => {
        $(
            impl $crate::wrap::Unwrap for $t {
                type Innermost = $t;

                fn innermost(&self) -> &$t {
                    self
                }

                fn innermost_mut(&mut self) -> &mut $t {
                    self
                }
            }
        )+
    };
}

const fn fix_channels(wrap: usize, native: usize) -> usize {
    if native != 0 && native != wrap {
        panic!("illegal channel wrap amount");
    }
    wrap
}

macro_rules! wrapper_common {
    ($name:ident [$($gen:tt)*] [$($arg:tt)*]) => {
        impl<$($gen)*> $name<$($arg)*> {
            /// The immediately wrapped node.
            pub fn object(&self) -> &N {
                &self.obj
            }

            pub fn object_mut(&mut self) -> &mut N {
                &mut self.obj
            }

            /// The innermost node below every wrapper layer.
            pub fn wrapped_object(&self) -> &<N as Unwrap>::Innermost
            where
                N: Unwrap,
            {
                self.obj.innermost()
            }
        }

        impl<$($gen)*> Unwrap for $name<$($arg)*>
        where
            N: Unwrap,
        {
            type Innermost = N::Innermost;

            fn innermost(&self) -> &Self::Innermost {
                self.obj.innermost()
            }

            fn innermost_mut(&mut self) -> &mut Self::Innermost {
                self.obj.innermost_mut()
            }
        }
    };
}

// ── fix ──────────────────────────────────────────────────────────────────

/// Pins the channel count of `N` to `C`.
#[derive(Debug, Clone, Default)]
pub struct Fix<const C: usize, N> {
    obj: N,
}

impl<const C: usize, N: Processor> Fix<C, N> {
    pub fn new(obj: N) -> Self {
        let _channels = <Self as Processor>::NUM_CHANNELS;
        Self { obj }
    }
}

impl<const C: usize, N: Processor> Processor for Fix<C, N> {
    const NUM_CHANNELS: usize = fix_channels(C, N::NUM_CHANNELS);

    fn reset(&mut self) {
        self.obj.reset();
    }

    fn process_frame(&mut self, frame: &mut [f32]) {
        self.obj.process_frame(frame);
    }

    fn prepare(&mut self, specs: &PrepareSpecs) {
        let specs = PrepareSpecs {
            num_channels: C,
            ..*specs
        };
        self.obj.prepare(&specs);
    }

    fn process(&mut self, data: &mut ProcessData<'_, '_>) {
        self.obj.process(data);
    }

    fn handle_event(&mut self, event: &mut HiseEvent) {
        self.obj.handle_event(event);
    }

    fn set_parameter(&mut self, index: usize, value: f64) {
        self.obj.set_parameter(index, value);
    }
}

wrapper_common!(Fix [const C: usize, N] [C, N]);

// ── frame ────────────────────────────────────────────────────────────────

/// Runs a block through `N::process_frame` one `C`-channel frame at a time.
#[derive(Debug, Clone, Default)]
pub struct Frame<const C: usize, N> {
    obj: N,
}

impl<const C: usize, N: Processor> Frame<C, N> {
    pub fn new(obj: N) -> Self {
        let _channels = <Self as Processor>::NUM_CHANNELS;
        Self { obj }
    }
}

impl<const C: usize, N: Processor> Processor for Frame<C, N> {
    const NUM_CHANNELS: usize = fix_channels(C, N::NUM_CHANNELS);

    fn reset(&mut self) {
        self.obj.reset();
    }

    fn process_frame(&mut self, frame: &mut [f32]) {
        self.obj.process_frame(frame);
    }

    fn prepare(&mut self, specs: &PrepareSpecs) {
        self.obj.prepare(specs);
    }

    fn process(&mut self, data: &mut ProcessData<'_, '_>) {
        let obj = &mut self.obj;
        data.for_each_frame(|frame| {
            let n = frame.len().min(C);
            obj.process_frame(&mut frame[..n]);
        });
    }

    fn handle_event(&mut self, event: &mut HiseEvent) {
        self.obj.handle_event(event);
    }

    fn set_parameter(&mut self, index: usize, value: f64) {
        self.obj.set_parameter(index, value);
    }
}

wrapper_common!(Frame [const C: usize, N] [C, N]);

// ── event ────────────────────────────────────────────────────────────────

/// Forwards events to `N` in addition to audio callbacks.
#[derive(Debug, Clone, Default)]
pub struct Event<N> {
    obj: N,
}

impl<N: Processor> Event<N> {
    pub fn new(obj: N) -> Self {
        Self { obj }
    }
}

impl<N: Processor> Processor for Event<N> {
    const NUM_CHANNELS: usize = N::NUM_CHANNELS;

    fn reset(&mut self) {
        self.obj.reset();
    }

    fn process_frame(&mut self, frame: &mut [f32]) {
        self.obj.process_frame(frame);
    }

    fn prepare(&mut self, specs: &PrepareSpecs) {
        self.obj.prepare(specs);
    }

    fn process(&mut self, data: &mut ProcessData<'_, '_>) {
        self.obj.process(data);
    }

    fn handle_event(&mut self, event: &mut HiseEvent) {
        self.obj.handle_event(event);
    }

    fn set_parameter(&mut self, index: usize, value: f64) {
        self.obj.set_parameter(index, value);
    }
}

wrapper_common!(Event [N] [N]);

// ── init ─────────────────────────────────────────────────────────────────

/// A one-time initializer built against the freshly constructed node.
pub trait Initialiser<N> {
    fn initialise(node: &mut N) -> Self;
}

/// Builds `N`, then constructs `I` with a reference to it.
#[derive(Debug, Clone)]
pub struct Init<N, I> {
    obj: N,
    initialiser: I,
}

impl<N: Processor, I: Initialiser<N>> Init<N, I> {
    pub fn new(mut obj: N) -> Self {
        let initialiser = I::initialise(&mut obj);
        Self { obj, initialiser }
    }

    pub fn initialiser(&self) -> &I {
        &self.initialiser
    }
}

impl<N: Processor + Default, I: Initialiser<N>> Default for Init<N, I> {
    fn default() -> Self {
        Self::new(N::default())
    }
}

impl<N: Processor, I> Processor for Init<N, I> {
    const NUM_CHANNELS: usize = N::NUM_CHANNELS;

    fn reset(&mut self) {
        self.obj.reset();
    }

    fn process_frame(&mut self, frame: &mut [f32]) {
        self.obj.process_frame(frame);
    }

    fn prepare(&mut self, specs: &PrepareSpecs) {
        self.obj.prepare(specs);
    }

    fn process(&mut self, data: &mut ProcessData<'_, '_>) {
        self.obj.process(data);
    }

    fn handle_event(&mut self, event: &mut HiseEvent) {
        self.obj.handle_event(event);
    }

    fn set_parameter(&mut self, index: usize, value: f64) {
        self.obj.set_parameter(index, value);
    }
}

wrapper_common!(Init [N, I] [N, I]);

// ── mod ──────────────────────────────────────────────────────────────────

/// Captures the modulation output of `N` after each callback.
#[derive(Debug, Clone, Default)]
pub struct Mod<N> {
    obj: N,
    pending: Option<f64>,
}

impl<N: Processor + ModulationSource> Mod<N> {
    pub fn new(obj: N) -> Self {
        Self { obj, pending: None }
    }

    fn poll(&mut self) {
        if let Some(v) = self.obj.handle_modulation() {
            self.pending = Some(v);
        }
    }

    /// Take the latest modulation value, if any arrived since the last take.
    pub fn take_modulation(&mut self) -> Option<f64> {
        self.pending.take()
    }

    /// Send the latest modulation value through `param` into `root`.
    pub fn drive<R, P: Parameter<R>>(&mut self, param: &P, root: &mut R) -> bool {
        match self.pending.take() {
            Some(v) => {
                param.call(root, 0, v);
                true
            }
            None => false,
        }
    }
}

impl<N: Processor + ModulationSource> Processor for Mod<N> {
    const NUM_CHANNELS: usize = N::NUM_CHANNELS;

    fn reset(&mut self) {
        self.obj.reset();
        self.pending = None;
    }

    fn process_frame(&mut self, frame: &mut [f32]) {
        self.obj.process_frame(frame);
        self.poll();
    }

    fn prepare(&mut self, specs: &PrepareSpecs) {
        self.obj.prepare(specs);
    }

    fn process(&mut self, data: &mut ProcessData<'_, '_>) {
        self.obj.process(data);
        self.poll();
    }

    fn handle_event(&mut self, event: &mut HiseEvent) {
        self.obj.handle_event(event);
    }

    fn set_parameter(&mut self, index: usize, value: f64) {
        self.obj.set_parameter(index, value);
    }
}

wrapper_common!(Mod [N] [N]);

// ── data ─────────────────────────────────────────────────────────────────

/// Hands binding `SLOT` to `N::set_external_data` during `prepare`.
#[derive(Debug, Clone, Default)]
pub struct Data<const SLOT: usize, N> {
    obj: N,
    source: ExternalData,
}

impl<const SLOT: usize, N: Processor + DataReceiver> Data<SLOT, N> {
    pub fn new(obj: N, source: ExternalData) -> Self {
        Self { obj, source }
    }

    /// Replace the binding; the node sees it on the next `prepare`.
    pub fn rebind(&mut self, source: ExternalData) {
        self.source = source;
    }
}

impl<const SLOT: usize, N: Processor + DataReceiver> Processor for Data<SLOT, N> {
    const NUM_CHANNELS: usize = N::NUM_CHANNELS;

    fn reset(&mut self) {
        self.obj.reset();
    }

    fn process_frame(&mut self, frame: &mut [f32]) {
        self.obj.process_frame(frame);
    }

    fn prepare(&mut self, specs: &PrepareSpecs) {
        self.obj.set_external_data(&self.source, SLOT);
        self.obj.prepare(specs);
    }

    fn process(&mut self, data: &mut ProcessData<'_, '_>) {
        self.obj.process(data);
    }

    fn handle_event(&mut self, event: &mut HiseEvent) {
        self.obj.handle_event(event);
    }

    fn set_parameter(&mut self, index: usize, value: f64) {
        self.obj.set_parameter(index, value);
    }
}

wrapper_common!(Data [const SLOT: usize, N] [SLOT, N]);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::{Plain, This};

    #[derive(Debug, Default)]
    struct Peak {
        peak: f32,
        changed: bool,
    }

    impl Processor for Peak {
        const NUM_CHANNELS: usize = 1;

        fn reset(&mut self) {
            self.peak = 0.0;
        }

        fn process_frame(&mut self, frame: &mut [f32]) {
            if frame[0].abs() > self.peak {
                self.peak = frame[0].abs();
                self.changed = true;
            }
        }
    }

    impl ModulationSource for Peak {
        fn handle_modulation(&mut self) -> Option<f64> {
            std::mem::take(&mut self.changed).then_some(self.peak as f64)
        }
    }

    #[derive(Debug, Default)]
    struct Target {
        value: f64,
    }

    impl Processor for Target {
        fn reset(&mut self) {}

        fn process_frame(&mut self, _frame: &mut [f32]) {}

        fn set_parameter(&mut self, _index: usize, value: f64) {
            self.value = value;
        }
    }

    impl DataReceiver for Target {
        fn set_external_data(&mut self, data: &ExternalData, slot: usize) {
            self.value = slot as f64 * 100.0 + data.num_samples() as f64;
        }
    }

    crate::leaf_node!(Peak, Target);

    struct Preset;

    impl Initialiser<Target> for Preset {
        fn initialise(node: &mut Target) -> Self {
            node.value = 4.0;
            Preset
        }
    }

    #[test]
    fn fix_accepts_matching_channels() {
        let w = Fix::<1, Peak>::new(Peak::default());
        assert_eq!(<Fix<1, Peak> as Processor>::NUM_CHANNELS, 1);
        assert_eq!(w.object().peak, 0.0);
    }

    #[test]
    fn wrapped_object_unwraps_every_layer() {
        let w = Event::new(Fix::<1, Peak>::new(Peak {
            peak: 3.0,
            changed: false,
        }));
        assert_eq!(w.wrapped_object().peak, 3.0);
    }

    #[test]
    fn init_runs_against_constructed_node() {
        let w = Init::<Target, Preset>::default();
        assert_eq!(w.object().value, 4.0);
    }

    #[test]
    fn mod_drives_target_parameter() {
        let mut m = Mod::new(Peak::default());
        let mut target = Target::default();
        m.process_frame(&mut [-0.75]);
        assert!(m.drive(&Plain::<This, 0>::default(), &mut target));
        assert_eq!(target.value, 0.75);
        assert!(!m.drive(&Plain::<This, 0>::default(), &mut target));
    }

    #[test]
    fn data_binds_slot_on_prepare() {
        let mut d = Data::<2, Target>::new(Target::default(), ExternalData::mono(vec![0.0f32; 8]));
        assert_eq!(d.object().value, 0.0);
        d.prepare(&PrepareSpecs::default());
        assert_eq!(d.wrapped_object().value, 208.0);
        d.rebind(ExternalData::mono(vec![0.0f32; 3]));
        d.prepare(&PrepareSpecs::default());
        assert_eq!(d.object().value, 203.0);
    }
}

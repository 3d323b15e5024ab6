// chain.rs — Sequential and parallel node containers
//
// `Chain<P, Nodes>` runs a tuple of nodes in declaration order; `Split<P,
// Nodes>` runs each node on a copy of the input and sums the results. Both
// route `set_parameter` through the parameter spec `P`, whose lenses address
// nodes inside the tuple.
//
// Preconditions: none.
// Postconditions: child callbacks run in declaration order.
// Failure modes: disagreeing child channel counts and out-of-range `get::<I>`
//                fail to compile.
// Side effects: none; no allocation on any callback.

use crate::node::{agree_channels, HiseEvent, PrepareSpecs, ProcessData, Processor, MAX_CHANNELS};
use crate::parameter::Parameter;

// ── Tuple access ─────────────────────────────────────────────────────────

/// Compile-time positional access.
pub trait Get<const I: usize> {
    type Output;

    fn get(&self) -> &Self::Output;

    fn get_mut(&mut self) -> &mut Self::Output;
}

macro_rules! tuple_get {
    ([$($T:ident),+] $idx:tt $Out:ident) => {
        impl<$($T),+> Get<$idx> for ($($T,)+) {
            type Output = $Out;

            fn get(&self) -> &$Out {
                &self.$idx
            }

            fn get_mut(&mut self) -> &mut $Out {
                &mut self.$idx
            }
        }
    };
}

tuple_get!([A] 0 A);
tuple_get!([A, B] 0 A);
tuple_get!([A, B] 1 B);
tuple_get!([A, B, C] 0 A);
tuple_get!([A, B, C] 1 B);
tuple_get!([A, B, C] 2 C);
tuple_get!([A, B, C, D] 0 A);
tuple_get!([A, B, C, D] 1 B);
tuple_get!([A, B, C, D] 2 C);
tuple_get!([A, B, C, D] 3 D);

// ── Node lists ───────────────────────────────────────────────────────────

/// A tuple of nodes processed as one unit.
pub trait NodeList {
    const LEN: usize;
    const NUM_CHANNELS: usize;

    fn reset_all(&mut self);
    fn prepare_all(&mut self, specs: &PrepareSpecs);
    fn process_all(&mut self, data: &mut ProcessData<'_, '_>);
    fn process_frame_all(&mut self, frame: &mut [f32]);
    fn handle_event_all(&mut self, event: &mut HiseEvent);

    /// Run every node on its own copy of `frame` and store the sum in `frame`.
    fn process_frame_sum(&mut self, frame: &mut [f32]);
}

fn accumulate(into: &mut [f32], from: &[f32]) {
    for (dst, src) in into.iter_mut().zip(from) {
        *dst += *src;
    }
}

macro_rules! node_list {
    ($len:expr; $($idx:tt : $T:ident),+) => {
        impl<$($T: Processor),+> NodeList for ($($T,)+) {
            const LEN: usize = $len;
            const NUM_CHANNELS: usize = {
                let mut c = 0;
                $(c = agree_channels(c, <$T as Processor>::NUM_CHANNELS);)+
                c
            };

            fn reset_all(&mut self) {
                $(self.$idx.reset();)+
            }

            fn prepare_all(&mut self, specs: &PrepareSpecs) {
                $(self.$idx.prepare(specs);)+
            }

            fn process_all(&mut self, data: &mut ProcessData<'_, '_>) {
                $(self.$idx.process(data);)+
            }

            fn process_frame_all(&mut self, frame: &mut [f32]) {
                $(self.$idx.process_frame(frame);)+
            }

            fn handle_event_all(&mut self, event: &mut HiseEvent) {
                $(self.$idx.handle_event(event);)+
            }

            fn process_frame_sum(&mut self, frame: &mut [f32]) {
                let n = frame.len().min(MAX_CHANNELS);
                let mut input = [0.0f32; MAX_CHANNELS];
                let mut sum = [0.0f32; MAX_CHANNELS];
                input[..n].copy_from_slice(&frame[..n]);
                $(
                    let mut copy = input;
                    self.$idx.process_frame(&mut copy[..n]);
                    accumulate(&mut sum[..n], &copy[..n]);
                )+
                frame[..n].copy_from_slice(&sum[..n]);
            }
        }
    };
}

node_list!(1; 0: A);
node_list!(2; 0: A, 1: B);
node_list!(3; 0: A, 1: B, 2: C);
node_list!(4; 0: A, 1: B, 2: C, 3: D);

// ── Containers ───────────────────────────────────────────────────────────

/// Serial composition.
#[derive(Debug, Clone, Default)]
pub struct Chain<P, Nodes> {
    pub params: P,
    nodes: Nodes,
}

/// Parallel composition with summed outputs.
#[derive(Debug, Clone, Default)]
pub struct Split<P, Nodes> {
    pub params: P,
    nodes: Nodes,
}

macro_rules! container_common {
    ($name:ident) => {
        impl<P: Parameter<Nodes>, Nodes: NodeList> $name<P, Nodes> {
            pub fn new(params: P, nodes: Nodes) -> Self {
                let _channels = <Self as Processor>::NUM_CHANNELS;
                Self { params, nodes }
            }

            pub fn get<const I: usize>(&self) -> &<Nodes as Get<I>>::Output
            where
                Nodes: Get<I>,
            {
                self.nodes.get()
            }

            pub fn get_mut<const I: usize>(&mut self) -> &mut <Nodes as Get<I>>::Output
            where
                Nodes: Get<I>,
            {
                self.nodes.get_mut()
            }

            pub fn nodes_mut(&mut self) -> &mut Nodes {
                &mut self.nodes
            }
        }

        impl<const I: usize, P, Nodes: Get<I>> Get<I> for $name<P, Nodes> {
            type Output = Nodes::Output;

            fn get(&self) -> &Self::Output {
                self.nodes.get()
            }

            fn get_mut(&mut self) -> &mut Self::Output {
                self.nodes.get_mut()
            }
        }
    };
}

container_common!(Chain);
container_common!(Split);

impl<P: Parameter<Nodes>, Nodes: NodeList> Processor for Chain<P, Nodes> {
    const NUM_CHANNELS: usize = Nodes::NUM_CHANNELS;

    fn reset(&mut self) {
        self.nodes.reset_all();
    }

    fn process_frame(&mut self, frame: &mut [f32]) {
        self.nodes.process_frame_all(frame);
    }

    fn prepare(&mut self, specs: &PrepareSpecs) {
        self.nodes.prepare_all(specs);
    }

    fn process(&mut self, data: &mut ProcessData<'_, '_>) {
        self.nodes.process_all(data);
    }

    fn handle_event(&mut self, event: &mut HiseEvent) {
        self.nodes.handle_event_all(event);
    }

    fn set_parameter(&mut self, index: usize, value: f64) {
        self.params.call(&mut self.nodes, index, value);
    }
}

impl<P: Parameter<Nodes>, Nodes: NodeList> Processor for Split<P, Nodes> {
    const NUM_CHANNELS: usize = Nodes::NUM_CHANNELS;

    fn reset(&mut self) {
        self.nodes.reset_all();
    }

    fn process_frame(&mut self, frame: &mut [f32]) {
        self.nodes.process_frame_sum(frame);
    }

    fn prepare(&mut self, specs: &PrepareSpecs) {
        self.nodes.prepare_all(specs);
    }

    fn process(&mut self, data: &mut ProcessData<'_, '_>) {
        let nodes = &mut self.nodes;
        data.for_each_frame(|frame| nodes.process_frame_sum(frame));
    }

    fn handle_event(&mut self, event: &mut HiseEvent) {
        self.nodes.handle_event_all(event);
    }

    fn set_parameter(&mut self, index: usize, value: f64) {
        self.params.call(&mut self.nodes, index, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::{self, At};

    #[derive(Debug, Default)]
    struct Mono {
        v: f64,
    }

    impl Processor for Mono {
        const NUM_CHANNELS: usize = 1;

        fn reset(&mut self) {
            self.v = 1.0;
        }

        fn process_frame(&mut self, frame: &mut [f32]) {
            frame[0] += self.v as f32;
        }

        fn set_parameter(&mut self, _index: usize, value: f64) {
            self.v = value;
        }
    }

    #[test]
    fn reset_reaches_every_child() {
        let mut c = Chain::new(parameter::Empty, (Mono::default(), Mono::default(), Mono::default()));
        c.reset();
        assert_eq!(c.get::<0>().v, 1.0);
        assert_eq!(c.get::<1>().v, 1.0);
        assert_eq!(c.get::<2>().v, 1.0);
    }

    #[test]
    fn chain_runs_in_order_and_split_sums() {
        let mut c = Chain::new(parameter::Empty, (Mono { v: 1.0 }, Mono { v: 2.0 }));
        let mut frame = [0.0f32];
        c.process_frame(&mut frame);
        assert_eq!(frame, [3.0]);

        let mut s = Split::new(parameter::Empty, (Mono { v: 1.0 }, Mono { v: 2.0 }));
        let mut frame = [1.0f32];
        s.process_frame(&mut frame);
        assert_eq!(frame, [5.0]);
    }

    #[test]
    fn set_parameter_routes_through_spec() {
        type Spec = parameter::List<(parameter::Plain<At<0>, 0>, parameter::Plain<At<1>, 0>)>;
        let mut c = Chain::new(Spec::default(), (Mono::default(), Mono::default()));
        c.set_parameter(1, 0.25);
        assert_eq!(c.get::<0>().v, 0.0);
        assert_eq!(c.get::<1>().v, 0.25);
    }

    #[test]
    fn container_channel_count_is_agreed() {
        type C = Chain<parameter::Empty, (Mono, Mono)>;
        assert_eq!(<C as Processor>::NUM_CHANNELS, 1);
    }
}

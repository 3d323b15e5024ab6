// parameter.rs — Parameter routing from control values to node parameters
//
// A parameter spec is a zero-sized routing type. Its targets are addressed by
// lenses relative to a root (a container's node tuple, or a single node), so
// the routing owns no references and a container can hold both its nodes and
// its spec. Every slot a spec declares is connected by construction; calling
// a slot outside the spec is a no-op.
//
// Preconditions: none.
// Postconditions: `call` reaches every target of the addressed slot once.
// Failure modes: none at runtime; bad lenses fail to compile.
// Side effects: mutates the addressed nodes only.

use std::marker::PhantomData;

use crate::chain::Get;
use crate::node::Processor;

// ── Lenses ───────────────────────────────────────────────────────────────

/// A compile-time path from a root to a target node.
pub trait Lens<Root> {
    type Target: Processor;

    fn focus(root: &mut Root) -> &mut Self::Target;
}

/// The root itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct This;

/// The `I`-th child of a tuple or container.
#[derive(Debug, Clone, Copy, Default)]
pub struct At<const I: usize>;

/// `B` applied to the target of `A`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Then<A, B>(PhantomData<(A, B)>);

impl<N: Processor> Lens<N> for This {
    type Target = N;

    fn focus(root: &mut N) -> &mut N {
        root
    }
}

impl<const I: usize, R> Lens<R> for At<I>
where
    R: Get<I>,
    R::Output: Processor,
{
    type Target = R::Output;

    fn focus(root: &mut R) -> &mut R::Output {
        root.get_mut()
    }
}

impl<R, A, B> Lens<R> for Then<A, B>
where
    A: Lens<R>,
    A::Target: 'static,
    B: Lens<A::Target>,
{
    type Target = B::Target;

    fn focus(root: &mut R) -> &mut B::Target {
        B::focus(A::focus(root))
    }
}

// ── Transforms ───────────────────────────────────────────────────────────

/// Maps a normalised value into a physical range and back.
pub trait Range {
    fn from0to1(value: f64) -> f64;

    fn to0to1(value: f64) -> f64;
}

/// The identity range.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Range for Identity {
    fn from0to1(value: f64) -> f64 {
        value
    }

    fn to0to1(value: f64) -> f64 {
        value
    }
}

/// A compile-time value transform.
pub trait Expression {
    fn op(value: f64) -> f64;
}

// ── Parameter specs ──────────────────────────────────────────────────────

/// A routing table from slots to node parameters under `Root`.
pub trait Parameter<Root> {
    const SLOTS: usize;

    fn call(&self, root: &mut Root, slot: usize, value: f64);
}

/// Forwards the value unchanged to parameter `P` of the lens target.
#[derive(Debug, Clone, Copy, Default)]
pub struct Plain<L, const P: usize>(PhantomData<L>);

/// Applies `E::op` before forwarding.
#[derive(Debug, Clone, Copy, Default)]
pub struct Expr<L, const P: usize, E>(PhantomData<(L, E)>);

/// Maps a normalised value through `R` before forwarding.
#[derive(Debug, Clone, Copy, Default)]
pub struct From0To1<L, const P: usize, R>(PhantomData<(L, R)>);

/// One slot fanned out to every sub-parameter after a shared range.
#[derive(Debug, Clone, Copy, Default)]
pub struct Chain<R, Ps>(PhantomData<R>, pub Ps);

/// Independently addressable slots.
#[derive(Debug, Clone, Copy, Default)]
pub struct List<Ps>(pub Ps);

/// No slots.
#[derive(Debug, Clone, Copy, Default)]
pub struct Empty;

impl<Root> Parameter<Root> for Empty {
    const SLOTS: usize = 0;

    fn call(&self, _root: &mut Root, _slot: usize, _value: f64) {}
}

impl<Root, L: Lens<Root>, const P: usize> Parameter<Root> for Plain<L, P> {
    const SLOTS: usize = 1;

    fn call(&self, root: &mut Root, slot: usize, value: f64) {
        if slot == 0 {
            L::focus(root).set_parameter(P, value);
        }
    }
}

impl<Root, L: Lens<Root>, const P: usize, E: Expression> Parameter<Root> for Expr<L, P, E> {
    const SLOTS: usize = 1;

    fn call(&self, root: &mut Root, slot: usize, value: f64) {
        if slot == 0 {
            L::focus(root).set_parameter(P, E::op(value));
        }
    }
}

impl<Root, L: Lens<Root>, const P: usize, R: Range> Parameter<Root> for From0To1<L, P, R> {
    const SLOTS: usize = 1;

    fn call(&self, root: &mut Root, slot: usize, value: f64) {
        if slot == 0 {
            L::focus(root).set_parameter(P, R::from0to1(value));
        }
    }
}

/// A tuple of parameter specs.
pub trait ParameterList<Root> {
    const LEN: usize;

    fn fan_out(&self, root: &mut Root, value: f64);

    fn call_slot(&self, root: &mut Root, slot: usize, value: f64);
}

macro_rules! parameter_list {
    ($len:expr; $($idx:tt : $T:ident),+) => {
        impl<Root, $($T: Parameter<Root>),+> ParameterList<Root> for ($($T,)+) {
            const LEN: usize = $len;

            fn fan_out(&self, root: &mut Root, value: f64) {
                $(self.$idx.call(root, 0, value);)+
            }

            fn call_slot(&self, root: &mut Root, slot: usize, value: f64) {
                match slot {
                    $($idx => self.$idx.call(root, 0, value),)+
                    _ => {}
                }
            }
        }
    };
}

parameter_list!(1; 0: A);
parameter_list!(2; 0: A, 1: B);
parameter_list!(3; 0: A, 1: B, 2: C);
parameter_list!(4; 0: A, 1: B, 2: C, 3: D);

impl<Root, R: Range, Ps: ParameterList<Root>> Parameter<Root> for Chain<R, Ps> {
    const SLOTS: usize = 1;

    fn call(&self, root: &mut Root, slot: usize, value: f64) {
        if slot == 0 {
            self.1.fan_out(root, R::from0to1(value));
        }
    }
}

impl<Root, Ps: ParameterList<Root>> Parameter<Root> for List<Ps> {
    const SLOTS: usize = Ps::LEN;

    fn call(&self, root: &mut Root, slot: usize, value: f64) {
        self.0.call_slot(root, slot, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Test {
        value: f64,
    }

    impl Processor for Test {
        fn reset(&mut self) {}

        fn process_frame(&mut self, _frame: &mut [f32]) {}

        fn set_parameter(&mut self, _index: usize, value: f64) {
            self.value = value;
        }
    }

    #[derive(Default)]
    struct Double;

    impl Range for Double {
        fn from0to1(value: f64) -> f64 {
            value * 2.0
        }

        fn to0to1(value: f64) -> f64 {
            value * 0.5
        }
    }

    #[derive(Default)]
    struct Square;

    impl Expression for Square {
        fn op(value: f64) -> f64 {
            value * value
        }
    }

    #[test]
    fn plain_forwards_value() {
        let mut t = Test::default();
        Plain::<This, 0>::default().call(&mut t, 0, 2.0);
        assert_eq!(t.value, 2.0);
    }

    #[test]
    fn chain_fans_out_after_range() {
        let mut nodes = (Test::default(), Test::default());
        let p: Chain<Double, _> = Chain(PhantomData, (Plain::<At<0>, 0>::default(), Plain::<At<1>, 0>::default()));
        p.call(&mut nodes, 0, 0.25);
        assert_eq!(nodes.0.value, 0.5);
        assert_eq!(nodes.1.value, 0.5);
    }

    #[test]
    fn list_addresses_one_slot() {
        let mut nodes = (Test::default(), Test::default());
        let p = List((Plain::<At<0>, 0>::default(), Expr::<At<1>, 0, Square>::default()));
        p.call(&mut nodes, 1, 3.0);
        assert_eq!(nodes.0.value, 0.0);
        assert_eq!(nodes.1.value, 9.0);
        p.call(&mut nodes, 5, 1.0);
        assert_eq!(nodes.0.value, 0.0);
    }

    #[test]
    fn from0to1_applies_range() {
        let mut t = Test::default();
        From0To1::<This, 0, Double>::default().call(&mut t, 0, 0.3);
        assert!((t.value - 0.6).abs() < 1e-12);
    }

    #[test]
    fn then_reaches_into_nested_containers() {
        use crate::chain::Chain as Serial;

        let inner = Serial::new(Empty, (Test::default(), Test::default()));
        let mut root = (Test::default(), inner);
        Plain::<Then<At<1>, At<1>>, 0>::default().call(&mut root, 0, 0.5);
        assert_eq!(root.1.get::<1>().value, 0.5);
        assert_eq!(root.1.get::<0>().value, 0.0);
        assert_eq!(root.0.value, 0.0);
    }
}

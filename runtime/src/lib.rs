// dspl-runtime — real-time node composition runtime
//
// Native counterparts of the DSP language's index types, spans and views,
// node containers, wrappers and parameter routing. Nothing on a processing
// callback allocates or locks.

pub mod chain;
pub mod container;
pub mod index;
pub mod node;
pub mod parameter;
pub mod poly;
pub mod wrap;

pub use container::{Dyn, SimdView, Span};
pub use node::{ExternalData, HiseEvent, PrepareSpecs, ProcessData, Processor};

// id.rs — Stable semantic identifiers for dspl compiler phases
//
// Arena indices for declarations and storage. Allocated in declaration order
// during analysis, so two compilations of the same source assign the same ids.

/// A concrete struct (including every template instantiation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StructId(pub u32);

/// A concrete function, method, constructor or destructor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub u32);

/// A struct or function template declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TemplateId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnumId(pub u32);

/// A declaration scope (global, namespace, struct or template instance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub u32);

/// A local variable or parameter slot inside one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub u32);

/// Static storage: a global variable or a static member of one instantiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalId(pub u32);

macro_rules! arena_index {
    ($($name:ident),*) => {
        $(
            impl $name {
                pub fn index(self) -> usize {
                    self.0 as usize
                }

                pub fn from_index(index: usize) -> Self {
                    $name(index as u32)
                }
            }
        )*
    };
}

arena_index!(StructId, FunctionId, TemplateId, EnumId, ScopeId, LocalId, GlobalId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_round_trips() {
        assert_eq!(StructId::from_index(3).index(), 3);
        assert_eq!(LocalId::from_index(0), LocalId(0));
    }
}

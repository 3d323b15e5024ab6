// dsplc — DSP language compiler front end
//
// Library root. Front end, semantic analysis, node graph validation, the
// backend boundary with its reference evaluator, and the driver.

pub mod ast;
pub mod backend;
pub mod builtins;
pub mod const_eval;
pub mod diag;
pub mod eval;
pub mod expr;
pub mod fixture;
pub mod graph;
pub mod id;
pub mod init;
pub mod lexer;
pub mod lifetime;
pub mod nodes;
pub mod parser;
pub mod pipeline;
pub mod sema;
pub mod stmt;
pub mod symbols;
pub mod templates;
pub mod thir;
pub mod types;

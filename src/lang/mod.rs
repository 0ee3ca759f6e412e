//! # Language model
//!
//! The analyzed AST handed over by the front end, the runtime value model
//! and the library function descriptors the executor calls into.
//!
//! ## Conventions
//!
//! - Stack effects in instruction docs are written as `( before -- after )`.
//! - Shared containers (List, Dictionary, Set, Struct) are mutated in place;
//!   every other value is immutable.

pub mod cast;
pub mod index;
pub mod node;
pub mod operator;
pub mod std_fn;
pub mod value;

//! Structural recovery: each pass locates one syntactic pattern in the
//! graph, builds a composite node, and rewires edges so the composite
//! replaces the subgraph. Pass order is fixed: fragments, short circuits,
//! loops (innermost first), conditionals, switches, try/catch.

pub mod conditionals;
pub mod fragments;
pub mod loops;
pub mod short_circuits;
pub mod switches;
pub mod try_catch;

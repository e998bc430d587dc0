//! Local algebraic rewrites applied over a graph.

mod transpose_fold;

pub use transpose_fold::fold_transposes;

//! Tensor shapes, broadcasting, and axis-permutation helpers.

use std::fmt;

use smallvec::SmallVec;

use crate::error::{Error, Result};

/// Compact storage for dimension lists and axis permutations.
pub type Axes = SmallVec<[usize; 4]>;

/// Stores the logical dimensions of a tensor.
///
/// The empty shape is permitted and denotes a scalar: its element count is 1.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Axes,
}

impl Shape {
    /// Constructs a new shape from the provided dimensions.
    pub fn new(dims: impl IntoIterator<Item = usize>) -> Self {
        Shape {
            dims: dims.into_iter().collect(),
        }
    }

    /// Borrow the raw dimension slice for downstream calculations.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Returns the rank (number of axes) of the shape.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Computes the total number of elements implied by the shape.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Broadcasts two shapes after right-alignment.
    ///
    /// The shorter shape is implicitly padded with leading 1s. Per axis: a 1
    /// loses against the other extent, equal extents win, anything else is a
    /// shape mismatch.
    pub fn broadcast(lhs: &Shape, rhs: &Shape) -> Result<Shape> {
        let rank = lhs.rank().max(rhs.rank());
        let mut dims = Axes::with_capacity(rank);
        for axis in 0..rank {
            let l = lhs.dim_from_right(rank - 1 - axis);
            let r = rhs.dim_from_right(rank - 1 - axis);
            let merged = match (l, r) {
                (1, r) => r,
                (l, 1) => l,
                (l, r) if l == r => l,
                (l, r) => {
                    return Err(Error::shape_mismatch(format!(
                        "cannot broadcast {lhs} against {rhs}: axis extents {l} vs {r}"
                    )))
                }
            };
            dims.push(merged);
        }
        Ok(Shape { dims })
    }

    fn dim_from_right(&self, back: usize) -> usize {
        if back < self.dims.len() {
            self.dims[self.dims.len() - 1 - back]
        } else {
            1
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (index, dim) in self.dims.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{dim}")?;
        }
        write!(f, "]")
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims.iter().copied())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape::new(dims)
    }
}

/// Returns true when the permutation keeps every axis in place.
pub fn is_identity_perm(perm: &[usize]) -> bool {
    perm.iter().copied().eq(0..perm.len())
}

/// Returns true when the permutation swaps the last two axes and fixes the rest.
pub fn is_swap_last_two(perm: &[usize]) -> bool {
    let rank = perm.len();
    if rank < 2 {
        return false;
    }
    perm[rank - 1] == rank - 2
        && perm[rank - 2] == rank - 1
        && perm[..rank - 2].iter().copied().eq(0..rank - 2)
}

/// Composes two permutations applied in sequence: `first`, then `second`.
pub fn compose_perms(first: &[usize], second: &[usize]) -> Option<Axes> {
    if first.len() != second.len() {
        return None;
    }
    let mut result = Axes::with_capacity(first.len());
    for &axis in second {
        if axis >= first.len() {
            return None;
        }
        result.push(first[axis]);
    }
    Some(result)
}

/// Checks that `perm` is a valid permutation of `0..rank`.
pub fn validate_perm(perm: &[usize], rank: usize) -> Result<()> {
    if perm.len() != rank {
        return Err(Error::shape_mismatch(format!(
            "permutation length {} must equal rank {rank}",
            perm.len()
        )));
    }
    let mut seen = vec![false; rank];
    for &axis in perm {
        if axis >= rank {
            return Err(Error::shape_mismatch(format!(
                "permutation axis {axis} out of range for rank {rank}"
            )));
        }
        if seen[axis] {
            return Err(Error::shape_mismatch(format!(
                "permutation repeats axis {axis}"
            )));
        }
        seen[axis] = true;
    }
    Ok(())
}

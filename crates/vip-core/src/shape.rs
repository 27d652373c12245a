use smallvec::SmallVec;
use std::fmt;

/// Tensor shape with stack-allocated storage for ≤4 dimensions.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape {
    dims: SmallVec<[usize; 4]>,
}

impl Shape {
    pub fn new(dims: &[usize]) -> Self {
        Self {
            dims: SmallVec::from_slice(dims),
        }
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.dims.get(axis).copied()
    }

    /// Number of elements in one slice along axis 0 (one "row" of the batch).
    pub fn row_len(&self) -> usize {
        self.dims.iter().skip(1).product()
    }

    /// Resolve a reshape target where at most one entry may be `-1`.
    pub fn resolve_reshape(&self, target: &[isize]) -> Option<Shape> {
        let numel = self.numel();
        let mut inferred = None;
        let mut known: usize = 1;

        for (i, &d) in target.iter().enumerate() {
            match d {
                -1 if inferred.is_none() => inferred = Some(i),
                d if d > 0 => known = known.checked_mul(d as usize)?,
                _ => return None,
            }
        }

        let mut dims: SmallVec<[usize; 4]> = target
            .iter()
            .map(|&d| if d == -1 { 0 } else { d as usize })
            .collect();

        if let Some(idx) = inferred {
            if known == 0 || !numel.is_multiple_of(known) {
                return None;
            }
            dims[idx] = numel / known;
        }

        let shape = Shape { dims };
        (shape.numel() == numel).then_some(shape)
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({:?})", self.dims.as_slice())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_len() {
        let s = Shape::new(&[8, 1, 28, 28]);
        assert_eq!(s.numel(), 8 * 784);
        assert_eq!(s.row_len(), 784);
    }

    #[test]
    fn test_resolve_reshape_infers_one_axis() {
        let s = Shape::new(&[4, 1, 4, 4]);
        let r = s.resolve_reshape(&[4, -1]).unwrap();
        assert_eq!(r.dims(), &[4, 16]);
        assert!(s.resolve_reshape(&[-1, -1]).is_none());
        assert!(s.resolve_reshape(&[3, -1]).is_none());
    }

    #[test]
    fn test_display() {
        assert_eq!(Shape::new(&[2, 3]).to_string(), "[2, 3]");
    }
}

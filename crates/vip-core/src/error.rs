use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Shape {shape:?} requires {expected} elements, got {got}")]
    LengthMismatch {
        shape: Vec<usize>,
        expected: usize,
        got: usize,
    },

    #[error("Cannot reshape tensor of {numel} elements into shape {shape:?}")]
    InvalidReshape { numel: usize, shape: Vec<usize> },

    #[error("Index {index} out of bounds for axis {axis} with size {size}")]
    IndexOutOfBounds {
        index: usize,
        axis: usize,
        size: usize,
    },

    #[error("Expected a tensor with {expected} dimensions, got {got}")]
    RankMismatch { expected: usize, got: usize },

    #[error("Missing parameter: {0}")]
    MissingParameter(String),
}

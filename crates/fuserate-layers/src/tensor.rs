//! Tensor type for neural network computations.
//!
//! A small dense tensor over `f32` in row-major order. It provides exactly
//! the operations the rating model needs; anything fancier (views, strides,
//! broadcasting beyond bias rows) is deliberately out of scope.

use serde::{Deserialize, Serialize};

/// A multi-dimensional array for neural network computations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    /// The shape of the tensor (dimensions)
    shape: Vec<usize>,
    /// The underlying data in row-major order
    data: Vec<f32>,
}

impl Tensor {
    /// Creates a new tensor with the given shape, filled with zeros.
    ///
    /// # Example
    ///
    /// ```
    /// use fuserate_layers::tensor::Tensor;
    ///
    /// let t = Tensor::zeros(&[2, 3]);
    /// assert_eq!(t.shape(), &[2, 3]);
    /// assert_eq!(t.numel(), 6);
    /// ```
    pub fn zeros(shape: &[usize]) -> Self {
        let numel: usize = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: vec![0.0; numel],
        }
    }

    /// Creates a new tensor with the given shape, filled with ones.
    pub fn ones(shape: &[usize]) -> Self {
        let numel: usize = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: vec![1.0; numel],
        }
    }

    /// Creates a new tensor with the given shape and data.
    ///
    /// # Panics
    ///
    /// Panics if the data length doesn't match the shape
    pub fn from_data(shape: &[usize], data: Vec<f32>) -> Self {
        let numel: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            numel,
            "Data length {} doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            numel
        );
        Self {
            shape: shape.to_vec(),
            data,
        }
    }

    /// Returns the shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Returns the total number of elements.
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Returns a reference to the underlying data.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Returns a mutable reference to the underlying data.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Returns row `i` of a 2D tensor as a slice.
    ///
    /// # Panics
    ///
    /// Panics if the tensor is not 2D or `i` is out of bounds.
    pub fn row(&self, i: usize) -> &[f32] {
        assert_eq!(self.ndim(), 2, "row() requires a 2D tensor");
        let n = self.shape[1];
        &self.data[i * n..(i + 1) * n]
    }

    /// Returns row `i` of a 2D tensor as a mutable slice.
    pub fn row_mut(&mut self, i: usize) -> &mut [f32] {
        assert_eq!(self.ndim(), 2, "row_mut() requires a 2D tensor");
        let n = self.shape[1];
        &mut self.data[i * n..(i + 1) * n]
    }

    /// Matrix multiplication between two 2D tensors.
    ///
    /// # Panics
    ///
    /// Panics if either tensor is not 2D or the inner dimensions don't match.
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        assert_eq!(self.ndim(), 2, "matmul requires 2D tensors");
        assert_eq!(other.ndim(), 2, "matmul requires 2D tensors");
        assert_eq!(
            self.shape[1], other.shape[0],
            "Inner dimensions must match for matmul"
        );

        let m = self.shape[0];
        let k = self.shape[1];
        let n = other.shape[1];

        let mut result = vec![0.0; m * n];
        for i in 0..m {
            for l in 0..k {
                let a = self.data[i * k + l];
                if a == 0.0 {
                    continue;
                }
                let row = &other.data[l * n..(l + 1) * n];
                let out = &mut result[i * n..(i + 1) * n];
                for (o, &b) in out.iter_mut().zip(row.iter()) {
                    *o += a * b;
                }
            }
        }

        Tensor::from_data(&[m, n], result)
    }

    /// Transposes a 2D tensor.
    pub fn transpose(&self) -> Tensor {
        assert_eq!(self.ndim(), 2, "transpose requires 2D tensor");
        let m = self.shape[0];
        let n = self.shape[1];

        let mut result = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                result[j * m + i] = self.data[i * n + j];
            }
        }

        Tensor::from_data(&[n, m], result)
    }

    /// Element-wise addition with bias broadcasting.
    ///
    /// Supports same-shape addition, scalar broadcast, and adding a 1D bias
    /// of length `n` to every row of a `[m, n]` tensor.
    pub fn add(&self, other: &Tensor) -> Tensor {
        if self.shape == other.shape {
            let data: Vec<f32> = self
                .data
                .iter()
                .zip(other.data.iter())
                .map(|(a, b)| a + b)
                .collect();
            Tensor::from_data(&self.shape, data)
        } else if other.numel() == 1 {
            let scalar = other.data[0];
            let data: Vec<f32> = self.data.iter().map(|a| a + scalar).collect();
            Tensor::from_data(&self.shape, data)
        } else if self.ndim() == 2 && other.ndim() == 1 && self.shape[1] == other.shape[0] {
            let mut data = self.data.clone();
            let n = self.shape[1];
            for i in 0..self.shape[0] {
                for j in 0..n {
                    data[i * n + j] += other.data[j];
                }
            }
            Tensor::from_data(&self.shape, data)
        } else {
            panic!(
                "Cannot broadcast shapes {:?} and {:?}",
                self.shape, other.shape
            );
        }
    }

    /// Element-wise subtraction of same-shape tensors.
    pub fn sub(&self, other: &Tensor) -> Tensor {
        assert_eq!(
            self.shape, other.shape,
            "sub requires matching shapes, got {:?} and {:?}",
            self.shape, other.shape
        );
        let data: Vec<f32> = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a - b)
            .collect();
        Tensor::from_data(&self.shape, data)
    }

    /// Element-wise multiplication.
    pub fn mul(&self, other: &Tensor) -> Tensor {
        if self.shape == other.shape {
            let data: Vec<f32> = self
                .data
                .iter()
                .zip(other.data.iter())
                .map(|(a, b)| a * b)
                .collect();
            Tensor::from_data(&self.shape, data)
        } else if other.numel() == 1 {
            let scalar = other.data[0];
            let data: Vec<f32> = self.data.iter().map(|a| a * scalar).collect();
            Tensor::from_data(&self.shape, data)
        } else {
            panic!(
                "Cannot multiply shapes {:?} and {:?}",
                self.shape, other.shape
            );
        }
    }

    /// Sum of all elements.
    pub fn sum(&self) -> f32 {
        self.data.iter().sum()
    }

    /// Sum along an axis of a 2D tensor.
    ///
    /// Axis 0 sums over rows producing `[n]`; axis 1 sums over columns
    /// producing `[m]`.
    pub fn sum_axis(&self, axis: usize) -> Tensor {
        assert_eq!(self.ndim(), 2, "sum_axis only implemented for 2D tensors");
        assert!(axis < 2, "Axis out of bounds");
        let m = self.shape[0];
        let n = self.shape[1];

        if axis == 0 {
            let mut result = vec![0.0; n];
            for i in 0..m {
                for j in 0..n {
                    result[j] += self.data[i * n + j];
                }
            }
            Tensor::from_data(&[n], result)
        } else {
            let result: Vec<f32> = (0..m)
                .map(|i| self.data[i * n..(i + 1) * n].iter().sum())
                .collect();
            Tensor::from_data(&[m], result)
        }
    }

    /// Applies a function element-wise.
    pub fn map<F>(&self, f: F) -> Tensor
    where
        F: Fn(f32) -> f32,
    {
        let data: Vec<f32> = self.data.iter().map(|&x| f(x)).collect();
        Tensor::from_data(&self.shape, data)
    }

    /// Reshapes the tensor to a new shape.
    ///
    /// # Panics
    ///
    /// Panics if the new shape has a different number of elements
    pub fn reshape(&self, new_shape: &[usize]) -> Tensor {
        let new_numel: usize = new_shape.iter().product();
        assert_eq!(
            self.numel(),
            new_numel,
            "Cannot reshape tensor of {} elements to shape {:?}",
            self.numel(),
            new_shape
        );
        Tensor::from_data(new_shape, self.data.clone())
    }

    /// Returns true if every element is finite (no NaN/Inf).
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|x| x.is_finite())
    }

    /// Adds `other` into `self` in place (same shape).
    pub fn add_assign(&mut self, other: &Tensor) {
        assert_eq!(
            self.shape, other.shape,
            "add_assign requires matching shapes, got {:?} and {:?}",
            self.shape, other.shape
        );
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += b;
        }
    }

    /// Resets every element to zero, keeping the shape.
    pub fn fill_zero(&mut self) {
        for x in self.data.iter_mut() {
            *x = 0.0;
        }
    }
}

//! Dense (fully connected) layer.
//!
//! Computes `y = act(xW + b)`. The forward pass is `&self` and returns an
//! explicit [`DenseCache`] in training mode; the backward pass consumes the
//! cache and accumulates gradients on the layer.

use crate::activation::Activation;
use crate::error::{LayerError, LayerResult};
use crate::initializer::Initializer;
use crate::params::{join, ParamMut, Parameterized};
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// A dense (fully connected) neural network layer.
///
/// The input may have any number of leading dimensions; the last dimension
/// must equal `in_features` and is replaced by `out_features` in the output.
///
/// # Example
///
/// ```
/// use fuserate_layers::dense::Dense;
/// use fuserate_layers::activation::Activation;
/// use fuserate_layers::tensor::Tensor;
/// use rand::{rngs::StdRng, SeedableRng};
///
/// let mut rng = StdRng::seed_from_u64(0);
/// let layer = Dense::new(16, 8, Activation::Tanh, &mut rng);
/// let input = Tensor::zeros(&[4, 16]);
/// let output = layer.forward(&input).unwrap();
/// assert_eq!(output.shape(), &[4, 8]);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dense {
    /// Weight matrix of shape [in_features, out_features]
    weights: Tensor,
    /// Bias vector of shape [out_features]
    bias: Tensor,
    /// Accumulated weight gradient
    weights_grad: Tensor,
    /// Accumulated bias gradient
    bias_grad: Tensor,
    /// Activation applied after the linear transform
    activation: Activation,
    in_features: usize,
    out_features: usize,
}

/// Cached values from a dense forward pass.
#[derive(Debug, Clone)]
pub struct DenseCache {
    /// Input flattened to [batch, in_features]
    input: Tensor,
    /// Pre-activation output [batch, out_features]
    preact: Tensor,
    /// Original input shape, for restoring the input gradient
    input_shape: Vec<usize>,
}

impl Dense {
    /// Creates a new dense layer with Xavier-initialized weights.
    pub fn new(
        in_features: usize,
        out_features: usize,
        activation: Activation,
        rng: &mut StdRng,
    ) -> Self {
        let init = Initializer::Xavier {
            fan_in: in_features,
            fan_out: out_features,
        };
        Self {
            weights: init.initialize(&[in_features, out_features], rng),
            bias: Tensor::zeros(&[out_features]),
            weights_grad: Tensor::zeros(&[in_features, out_features]),
            bias_grad: Tensor::zeros(&[out_features]),
            activation,
            in_features,
            out_features,
        }
    }

    /// Returns the input feature dimension.
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Returns the output feature dimension.
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    fn flatten_input(&self, input: &Tensor) -> LayerResult<(Tensor, Vec<usize>)> {
        if input.ndim() < 2 {
            return Err(LayerError::ForwardError {
                message: format!(
                    "Dense expects at least 2D input, got {}D",
                    input.ndim()
                ),
            });
        }
        let in_dim = *input.shape().last().unwrap_or(&0);
        if in_dim != self.in_features {
            return Err(LayerError::InvalidInputDimension {
                expected: self.in_features,
                actual: in_dim,
            });
        }
        let batch = input.numel() / in_dim;
        Ok((input.reshape(&[batch, in_dim]), input.shape().to_vec()))
    }

    fn output_shape(&self, input_shape: &[usize]) -> Vec<usize> {
        let mut out = input_shape.to_vec();
        let last = out.len() - 1;
        out[last] = self.out_features;
        out
    }

    /// Performs a forward pass.
    pub fn forward(&self, input: &Tensor) -> LayerResult<Tensor> {
        let (input_2d, shape) = self.flatten_input(input)?;
        let pre = input_2d.matmul(&self.weights).add(&self.bias);
        let act = self.activation;
        Ok(pre.map(|x| act.apply(x)).reshape(&self.output_shape(&shape)))
    }

    /// Performs a forward pass, returning the cache needed for backward.
    pub fn forward_train(&self, input: &Tensor) -> LayerResult<(Tensor, DenseCache)> {
        let (input_2d, shape) = self.flatten_input(input)?;
        let pre = input_2d.matmul(&self.weights).add(&self.bias);
        let act = self.activation;
        let out = pre.map(|x| act.apply(x)).reshape(&self.output_shape(&shape));
        let cache = DenseCache {
            input: input_2d,
            preact: pre,
            input_shape: shape,
        };
        Ok((out, cache))
    }

    /// Accumulates parameter gradients and returns the input gradient.
    pub fn backward(&mut self, grad: &Tensor, cache: &DenseCache) -> LayerResult<Tensor> {
        let out_dim = *grad.shape().last().unwrap_or(&0);
        if out_dim != self.out_features {
            return Err(LayerError::ShapeMismatch {
                expected: vec![self.out_features],
                actual: vec![out_dim],
            });
        }
        let batch = cache.input.shape()[0];
        if grad.numel() != batch * out_dim {
            return Err(LayerError::BackwardError {
                message: format!(
                    "gradient has {} elements, cache expects {}",
                    grad.numel(),
                    batch * out_dim
                ),
            });
        }
        let grad_2d = grad.reshape(&[batch, out_dim]);

        // d pre = d out * act'(pre)
        let act = self.activation;
        let dpre = grad_2d.mul(&cache.preact.map(|x| act.grad(x)));

        self.weights_grad
            .add_assign(&cache.input.transpose().matmul(&dpre));
        self.bias_grad.add_assign(&dpre.sum_axis(0));

        let dx = dpre.matmul(&self.weights.transpose());
        Ok(dx.reshape(&cache.input_shape))
    }
}

impl Parameterized for Dense {
    fn visit_params(&self, prefix: &str, f: &mut dyn FnMut(&str, &Tensor)) {
        f(&join(prefix, "weights"), &self.weights);
        f(&join(prefix, "bias"), &self.bias);
    }

    fn visit_params_mut(&mut self, prefix: &str, f: &mut dyn FnMut(ParamMut<'_>)) {
        f(ParamMut {
            name: join(prefix, "weights"),
            value: &mut self.weights,
            grad: Some(&mut self.weights_grad),
        });
        f(ParamMut {
            name: join(prefix, "bias"),
            value: &mut self.bias,
            grad: Some(&mut self.bias_grad),
        });
    }

    fn zero_grads(&mut self) {
        self.weights_grad.fill_zero();
        self.bias_grad.fill_zero();
    }
}

//! Parameter visitation.
//!
//! Optimizers and checkpoints both need to walk every parameter of a model
//! by name. [`Parameterized`] is that seam: layers expose their tensors
//! through it, composites delegate to their children with a dotted prefix.

use crate::tensor::Tensor;

/// Joins a prefix and a local parameter name with a dot.
pub fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// A mutable view of one named parameter.
///
/// `grad` is `None` for frozen parameters (pretrained word embeddings, the
/// photo backbone): they are still part of the checkpointed state but the
/// optimizer never touches them.
pub struct ParamMut<'a> {
    /// Fully qualified parameter name, e.g. `review.gru.w_r_x`.
    pub name: String,
    /// The parameter tensor.
    pub value: &'a mut Tensor,
    /// Accumulated gradient, if the parameter is trainable.
    pub grad: Option<&'a mut Tensor>,
}

/// A component that owns named, checkpointable parameters.
pub trait Parameterized {
    /// Visits every parameter (trainable and frozen) read-only.
    fn visit_params(&self, prefix: &str, f: &mut dyn FnMut(&str, &Tensor));

    /// Visits every parameter mutably, with gradients for trainable ones.
    fn visit_params_mut(&mut self, prefix: &str, f: &mut dyn FnMut(ParamMut<'_>));

    /// Clears all accumulated gradients.
    fn zero_grads(&mut self);
}

/// Dense layers with SiLU activations
use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

/// LinearSwish activation
///
/// SiLU(Linear(x)): a biased linear transformation followed by Swish.
pub struct LinearSwish {
    linear: Linear,
}

impl LinearSwish {
    /// Create new LinearSwish layer
    ///
    /// # Arguments
    /// * `in_features` - Input dimension
    /// * `out_features` - Output dimension
    /// * `vb` - VarBuilder for parameter initialization
    pub fn new(in_features: usize, out_features: usize, vb: VarBuilder) -> Result<Self> {
        let linear = linear(in_features, out_features, vb.pp("linear"))?;
        Ok(Self { linear })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let linear_out = self.linear.forward(x)?;
        candle_nn::ops::silu(&linear_out)
    }
}

/// Two-layer perceptron: Linear -> SiLU -> Linear
pub struct Mlp {
    hidden: LinearSwish,
    out: Linear,
}

impl Mlp {
    pub fn new(in_features: usize, hidden: usize, out_features: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            hidden: LinearSwish::new(in_features, hidden, vb.pp("hidden"))?,
            out: linear(hidden, out_features, vb.pp("out"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.out.forward(&self.hidden.forward(x)?)
    }
}

/// Gaussian radial basis expansion of interatomic distances
use candle_core::{Device, Result, Tensor};

/// Expands a distance into `num_radial` Gaussians centred evenly on [0, cutoff]
///
/// Not learned: centres and width are fixed at construction.
pub struct GaussianSmearing {
    offsets: Tensor,
    coeff: f64,
}

impl GaussianSmearing {
    pub fn new(cutoff: f64, num_radial: usize, device: &Device) -> Result<Self> {
        let steps = num_radial.max(2);
        let spacing = cutoff / (steps - 1) as f64;
        let offsets: Vec<f32> = (0..num_radial)
            .map(|k| (k as f64 * spacing) as f32)
            .collect();
        let offsets = Tensor::from_vec(offsets, (1, num_radial), device)?;
        Ok(Self {
            offsets,
            coeff: -0.5 / (spacing * spacing),
        })
    }

    /// `distances`: [num_edges, 1] -> [num_edges, num_radial]
    pub fn forward(&self, distances: &Tensor) -> Result<Tensor> {
        let offsets = if self.offsets.dtype() != distances.dtype() {
            self.offsets.to_dtype(distances.dtype())?
        } else {
            self.offsets.clone()
        };
        distances
            .broadcast_sub(&offsets)?
            .sqr()?
            .affine(self.coeff, 0.0)?
            .exp()
    }
}

/// Euclidean distance per edge: [num_edges, 1]
pub fn edge_distances(positions: &Tensor, src: &Tensor, dst: &Tensor) -> Result<Tensor> {
    let delta = (positions.index_select(src, 0)? - positions.index_select(dst, 0)?)?;
    delta.sqr()?.sum_keepdim(1)?.sqrt()
}

/// Property prediction models
///
/// The training loop only sees [`PropertyModel`]: a differentiable map from a
/// molecular batch to one scalar per molecule plus an ordered parameter set.
use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::{linear, Dropout, Linear, Module, VarBuilder, VarMap};

use crate::config::ModelConfig;
use crate::data::MolecularBatch;
use crate::layers::{edge_distances, AtomEmbedding, GaussianSmearing, LinearSwish, Mlp};

/// A trainable molecule -> scalar regressor
pub trait PropertyModel {
    /// Per-molecule predictions: [num_graphs]
    ///
    /// `train` toggles training-mode behaviour such as dropout.
    fn forward_t(&self, batch: &MolecularBatch, train: bool) -> Result<Tensor>;

    /// Trainable parameters ordered by name
    fn parameters(&self) -> Vec<(String, Var)>;
}

/// Sorted `(name, var)` pairs from a VarMap
pub fn named_parameters(varmap: &VarMap) -> Vec<(String, Var)> {
    let data = match varmap.data().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let mut params: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    params.sort_by(|a, b| a.0.cmp(&b.0));
    params
}

/// Continuous-filter interaction block
///
/// Messages from neighbours are gated by a filter computed from the radial
/// basis of the edge length, summed per destination atom, and added back as
/// a residual update.
pub struct InteractionBlock {
    filter: Linear,
    message: LinearSwish,
    update: Mlp,
}

impl InteractionBlock {
    pub fn new(dim: usize, num_radial: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            filter: linear(num_radial, dim, vb.pp("filter"))?,
            message: LinearSwish::new(dim, dim, vb.pp("message"))?,
            update: Mlp::new(dim, dim, dim, vb.pp("update"))?,
        })
    }

    /// # Arguments
    /// * `h` - Atom features [num_atoms, dim]
    /// * `rbf` - Edge basis [num_edges, num_radial]
    /// * `src`, `dst` - Edge endpoints [num_edges]
    pub fn forward(&self, h: &Tensor, rbf: &Tensor, src: &Tensor, dst: &Tensor) -> Result<Tensor> {
        let weights = self.filter.forward(rbf)?;
        let messages = self.message.forward(&h.index_select(src, 0)?)?.mul(&weights)?;
        let aggregated = h.zeros_like()?.index_add(dst, &messages, 0)?;
        h + self.update.forward(&aggregated)?
    }
}

/// Message-passing network over radius graphs
///
/// Atom embeddings are refined by `n_layer` interaction blocks, mapped to one
/// scalar per atom and summed per molecule.
pub struct MessagePassingNet {
    varmap: VarMap,
    embedding: AtomEmbedding,
    rbf: GaussianSmearing,
    layers: Vec<InteractionBlock>,
    dropout: Dropout,
    readout: Mlp,
}

impl MessagePassingNet {
    /// Create a freshly initialised network on `device`
    pub fn new(config: &ModelConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let embedding = AtomEmbedding::new(
            config.max_atomic_number,
            config.dim,
            vb.pp("embedding"),
            DType::F32,
        )?;
        let rbf = GaussianSmearing::new(config.cutoff, config.num_radial, device)?;

        let mut layers = Vec::with_capacity(config.n_layer);
        for i in 0..config.n_layer {
            layers.push(InteractionBlock::new(
                config.dim,
                config.num_radial,
                vb.pp(format!("interaction_{}", i)),
            )?);
        }

        let readout = Mlp::new(config.dim, config.dim / 2 + 1, 1, vb.pp("readout"))?;

        Ok(Self {
            varmap,
            embedding,
            rbf,
            layers,
            dropout: Dropout::new(config.dropout),
            readout,
        })
    }
}

impl PropertyModel for MessagePassingNet {
    fn forward_t(&self, batch: &MolecularBatch, train: bool) -> Result<Tensor> {
        let mut h = self.embedding.forward(&batch.atomic_numbers)?;

        if batch.edge_src.dim(0)? > 0 {
            let distances = edge_distances(&batch.positions, &batch.edge_src, &batch.edge_dst)?;
            let rbf = self.rbf.forward(&distances)?;
            for layer in &self.layers {
                h = layer.forward(&h, &rbf, &batch.edge_src, &batch.edge_dst)?;
            }
        }

        let h = self.dropout.forward(&h, train)?;
        let per_atom = self.readout.forward(&h)?.squeeze(1)?;
        let pooled = Tensor::zeros(batch.num_graphs, per_atom.dtype(), per_atom.device())?;
        pooled.index_add(&batch.graph_index, &per_atom, 0)
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        named_parameters(&self.varmap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Molecule;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            dim: 8,
            n_layer: 2,
            cutoff: 3.0,
            num_radial: 6,
            max_atomic_number: 9,
            dropout: 0.0,
        }
    }

    fn batch(device: &Device) -> Result<MolecularBatch> {
        let a = Molecule {
            atomic_numbers: vec![6, 1, 1],
            positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            target: 1.0,
        };
        let b = Molecule {
            atomic_numbers: vec![8, 1],
            positions: vec![[0.0, 0.0, 0.0], [0.9, 0.0, 0.0]],
            target: 2.0,
        };
        MolecularBatch::collate(&[&a, &b], 3.0, device)
    }

    #[test]
    fn test_forward_one_prediction_per_molecule() -> Result<()> {
        let device = Device::Cpu;
        let model = MessagePassingNet::new(&tiny_config(), &device)?;
        let out = model.forward_t(&batch(&device)?, false)?;
        assert_eq!(out.dims(), &[2]);
        Ok(())
    }

    #[test]
    fn test_parameters_sorted_and_named() -> Result<()> {
        let model = MessagePassingNet::new(&tiny_config(), &Device::Cpu)?;
        let params = model.parameters();
        assert!(!params.is_empty());

        let names: Vec<&str> = params.iter().map(|(n, _)| n.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert!(names.contains(&"embedding.weight"));
        Ok(())
    }

    #[test]
    fn test_gradients_reach_every_parameter() -> Result<()> {
        let device = Device::Cpu;
        let model = MessagePassingNet::new(&tiny_config(), &device)?;
        let batch = batch(&device)?;

        let loss = model.forward_t(&batch, true)?.sub(&batch.targets)?.abs()?.mean_all()?;
        let grads = loss.backward()?;

        for (name, var) in model.parameters() {
            assert!(grads.get(var.as_tensor()).is_some(), "no gradient for {}", name);
        }
        Ok(())
    }
}

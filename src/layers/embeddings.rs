/// Atom-type embedding
use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{Embedding, VarBuilder};

/// Embedding table indexed by atomic number, with automatic dtype casting
pub struct AtomEmbedding {
    embedding: Embedding,
    target_dtype: DType,
}

impl AtomEmbedding {
    pub fn new(max_atomic_number: usize, hidden_size: usize, vb: VarBuilder, target_dtype: DType) -> Result<Self> {
        // Row 0 is unused so atomic numbers index directly
        let embedding = candle_nn::embedding(max_atomic_number + 1, hidden_size, vb)?;
        Ok(Self {
            embedding,
            target_dtype,
        })
    }

    /// `atomic_numbers`: [num_atoms] (u32) -> [num_atoms, hidden_size]
    pub fn forward(&self, atomic_numbers: &Tensor) -> Result<Tensor> {
        let output = self.embedding.forward(atomic_numbers)?;
        if output.dtype() != self.target_dtype {
            output.to_dtype(self.target_dtype)
        } else {
            Ok(output)
        }
    }
}

/// Neural network layer primitives
///
/// Building blocks for the message-passing network:
/// - Atom-type embeddings (with automatic dtype casting)
/// - Gaussian radial basis expansion of edge lengths
/// - Dense layers with SiLU activations

pub mod activations;
pub mod embeddings;
pub mod radial;

pub use activations::{LinearSwish, Mlp};
pub use embeddings::AtomEmbedding;
pub use radial::{edge_distances, GaussianSmearing};

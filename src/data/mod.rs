/// Data loading modules for molecular property training
pub mod molecule;
pub mod qm9;

pub use molecule::{MolecularBatch, Molecule};
pub use qm9::{DatasetMetadata, MoleculeLoader, Qm9Dataset, Qm9Split};

use candle_core::Device;

/// Generic data loader trait
///
/// The training loop treats each call to `next_batch` as a blocking fetch of
/// one unit of work.
pub trait BatchDataLoader {
    /// Get the next batch, or `None` at the end of the epoch
    fn next_batch(&mut self, device: &Device) -> crate::Result<Option<MolecularBatch>>;

    /// Reset loader for new epoch
    fn reset(&mut self);

    /// Get total number of batches
    fn num_batches(&self) -> usize;

    /// Number of molecules the loader walks through per epoch
    fn dataset_len(&self) -> usize;
}

/// QM9-style dataset loader (.npy format)
use candle_core::Device;
use ndarray::{Array1, Array2};
use ndarray_npy::ReadNpyExt;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use super::{BatchDataLoader, MolecularBatch, Molecule};

/// Metadata from dataset.json
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatasetMetadata {
    #[serde(default)]
    pub num_molecules: usize,
    #[serde(default)]
    pub num_targets: usize,
    #[serde(default)]
    pub description: String,
}

/// Molecules loaded from flat NumPy arrays
///
/// Atoms of all molecules are stored back to back; `num_atoms.npy` gives the
/// length of each molecule's run.
#[derive(Debug, Clone)]
pub struct Qm9Dataset {
    molecules: Vec<Molecule>,
    metadata: DatasetMetadata,
}

/// Shuffled train/validation/test partition
pub struct Qm9Split {
    pub train: Vec<Molecule>,
    pub valid: Vec<Molecule>,
    pub test: Vec<Molecule>,
}

fn read_npy<T: ReadNpyExt>(dir: &Path, name: &str) -> crate::Result<T> {
    let path = dir.join(name);
    T::read_npy(File::open(&path)?)
        .map_err(|e| crate::TrainError::Data(format!("Failed to read {}: {}", name, e)))
}

impl Qm9Dataset {
    /// Load from a directory of .npy files, selecting one target column
    pub fn from_directory<P: AsRef<Path>>(path: P, target_column: usize) -> crate::Result<Self> {
        let dir = path.as_ref();

        log::info!("Loading QM9 dataset from: {:?}", dir);

        let metadata_path = dir.join("dataset.json");
        let metadata: DatasetMetadata = if metadata_path.exists() {
            let reader = BufReader::new(File::open(&metadata_path)?);
            serde_json::from_reader(reader)?
        } else {
            log::warn!("dataset.json not found, using defaults");
            DatasetMetadata {
                num_molecules: 0,
                num_targets: 0,
                description: "Unknown".to_string(),
            }
        };

        let atomic_numbers: Array1<i64> = read_npy(dir, "atomic_numbers.npy")?;
        let positions: Array2<f32> = read_npy(dir, "positions.npy")?;
        let num_atoms: Array1<i64> = read_npy(dir, "num_atoms.npy")?;
        let targets: Array2<f32> = read_npy(dir, "targets.npy")?;

        log::info!(
            "Loaded arrays: atoms {:?}, positions {:?}, molecules {:?}, targets {:?}",
            atomic_numbers.shape(),
            positions.shape(),
            num_atoms.shape(),
            targets.shape()
        );

        let molecules = Self::assemble(
            &atomic_numbers,
            &positions,
            &num_atoms,
            &targets,
            target_column,
        )?;

        log::info!(
            "Dataset loaded: {} molecules, target column {}",
            molecules.len(),
            target_column
        );

        Ok(Self {
            molecules,
            metadata,
        })
    }

    /// Build from already-constructed molecules
    pub fn from_molecules(molecules: Vec<Molecule>) -> Self {
        let metadata = DatasetMetadata {
            num_molecules: molecules.len(),
            num_targets: 1,
            description: "in-memory".to_string(),
        };
        Self {
            molecules,
            metadata,
        }
    }

    fn assemble(
        atomic_numbers: &Array1<i64>,
        positions: &Array2<f32>,
        num_atoms: &Array1<i64>,
        targets: &Array2<f32>,
        target_column: usize,
    ) -> crate::Result<Vec<Molecule>> {
        if positions.nrows() != atomic_numbers.len() || positions.ncols() != 3 {
            return Err(crate::TrainError::Data(format!(
                "Shape mismatch: positions {:?} for {} atoms",
                positions.shape(),
                atomic_numbers.len()
            )));
        }
        if targets.nrows() != num_atoms.len() {
            return Err(crate::TrainError::Data(format!(
                "Shape mismatch: {} target rows for {} molecules",
                targets.nrows(),
                num_atoms.len()
            )));
        }
        if target_column >= targets.ncols() {
            return Err(crate::TrainError::Data(format!(
                "Target column {} out of range ({} columns)",
                target_column,
                targets.ncols()
            )));
        }
        if let Some((m, &count)) = num_atoms.iter().enumerate().find(|(_, count)| **count < 0) {
            return Err(crate::TrainError::Data(format!(
                "Molecule {} has negative atom count {}",
                m, count
            )));
        }
        let total: i64 = num_atoms.sum();
        if total < 0 || total as usize != atomic_numbers.len() {
            return Err(crate::TrainError::Data(format!(
                "num_atoms sums to {} but {} atoms were loaded",
                total,
                atomic_numbers.len()
            )));
        }

        let mut molecules = Vec::with_capacity(num_atoms.len());
        let mut start = 0usize;
        for (m, &count) in num_atoms.iter().enumerate() {
            let end = start + count as usize;
            let z = atomic_numbers
                .slice(ndarray::s![start..end])
                .iter()
                .map(|&x| x as u32)
                .collect();
            let pos = (start..end)
                .map(|i| [positions[[i, 0]], positions[[i, 1]], positions[[i, 2]]])
                .collect();
            molecules.push(Molecule {
                atomic_numbers: z,
                positions: pos,
                target: targets[[m, target_column]],
            });
            start = end;
        }
        Ok(molecules)
    }

    /// Get number of molecules
    pub fn len(&self) -> usize {
        self.molecules.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.molecules.is_empty()
    }

    /// Get metadata
    pub fn metadata(&self) -> &DatasetMetadata {
        &self.metadata
    }

    pub fn molecules(&self) -> &[Molecule] {
        &self.molecules
    }

    /// Shuffle with a fixed seed, then cut into train, validation and test
    pub fn split(self, train_size: usize, valid_size: usize, seed: u64) -> crate::Result<Qm9Split> {
        if train_size + valid_size >= self.molecules.len() {
            return Err(crate::TrainError::Config(format!(
                "train_size {} + valid_size {} leaves no test molecules out of {}",
                train_size,
                valid_size,
                self.molecules.len()
            )));
        }

        let mut molecules = self.molecules;
        let mut rng = StdRng::seed_from_u64(seed);
        molecules.shuffle(&mut rng);

        let test = molecules.split_off(train_size + valid_size);
        let valid = molecules.split_off(train_size);
        Ok(Qm9Split {
            train: molecules,
            valid,
            test,
        })
    }
}

/// Batching loader over a list of molecules
pub struct MoleculeLoader {
    molecules: Vec<Molecule>,
    batch_size: usize,
    cutoff: f64,
    current_idx: usize,
    indices: Vec<usize>,
    shuffle: bool,
    rng: StdRng,
}

impl MoleculeLoader {
    /// Create new data loader
    pub fn new(molecules: Vec<Molecule>, batch_size: usize, cutoff: f64, shuffle: bool, seed: u64) -> Self {
        let indices: Vec<usize> = (0..molecules.len()).collect();
        let mut loader = Self {
            molecules,
            batch_size: batch_size.max(1),
            cutoff,
            current_idx: 0,
            indices,
            shuffle,
            rng: StdRng::seed_from_u64(seed),
        };
        if loader.shuffle {
            loader.indices.shuffle(&mut loader.rng);
        }
        loader
    }

    /// Get next batch
    pub fn next_batch(&mut self, device: &Device) -> crate::Result<Option<MolecularBatch>> {
        if self.current_idx >= self.indices.len() {
            return Ok(None);
        }

        let end_idx = (self.current_idx + self.batch_size).min(self.indices.len());
        let batch: Vec<&Molecule> = self.indices[self.current_idx..end_idx]
            .iter()
            .map(|&i| &self.molecules[i])
            .collect();
        self.current_idx = end_idx;

        Ok(Some(MolecularBatch::collate(&batch, self.cutoff, device)?))
    }

    /// Reset loader for new epoch
    pub fn reset(&mut self) {
        self.current_idx = 0;
        if self.shuffle {
            self.indices.shuffle(&mut self.rng);
        }
    }

    /// Get number of batches
    pub fn num_batches(&self) -> usize {
        (self.molecules.len() + self.batch_size - 1) / self.batch_size
    }

    pub fn len(&self) -> usize {
        self.molecules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.molecules.is_empty()
    }
}

impl BatchDataLoader for MoleculeLoader {
    fn next_batch(&mut self, device: &Device) -> crate::Result<Option<MolecularBatch>> {
        MoleculeLoader::next_batch(self, device)
    }

    fn reset(&mut self) {
        MoleculeLoader::reset(self)
    }

    fn num_batches(&self) -> usize {
        MoleculeLoader::num_batches(self)
    }

    fn dataset_len(&self) -> usize {
        self.molecules.len()
    }
}

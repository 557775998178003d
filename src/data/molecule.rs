/// Molecules and radius-graph batches
use candle_core::{Device, Result, Tensor};

/// A single molecule with its regression target
#[derive(Debug, Clone, PartialEq)]
pub struct Molecule {
    /// Atomic number per atom
    pub atomic_numbers: Vec<u32>,
    /// Cartesian coordinates per atom (Angstrom)
    pub positions: Vec<[f32; 3]>,
    /// Selected target property
    pub target: f32,
}

impl Molecule {
    pub fn num_atoms(&self) -> usize {
        self.atomic_numbers.len()
    }

    /// Directed edges `(src, dst)` between distinct atoms closer than `cutoff`
    pub fn radius_edges(&self, cutoff: f64) -> Vec<(usize, usize)> {
        let cutoff_sq = (cutoff * cutoff) as f32;
        let mut edges = Vec::new();
        for (i, a) in self.positions.iter().enumerate() {
            for (j, b) in self.positions.iter().enumerate() {
                if i == j {
                    continue;
                }
                let d2: f32 = a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum();
                if d2 < cutoff_sq {
                    edges.push((j, i));
                }
            }
        }
        edges
    }
}

/// Several molecules packed into one disjoint graph
///
/// Atoms of all molecules are concatenated; `graph_index` maps every atom back
/// to its molecule so per-atom outputs can be pooled into per-molecule
/// predictions.
#[derive(Debug, Clone)]
pub struct MolecularBatch {
    /// Atomic numbers: [num_atoms] (u32)
    pub atomic_numbers: Tensor,
    /// Positions: [num_atoms, 3] (f32)
    pub positions: Tensor,
    /// Edge sources: [num_edges] (u32)
    pub edge_src: Tensor,
    /// Edge destinations: [num_edges] (u32)
    pub edge_dst: Tensor,
    /// Molecule index per atom: [num_atoms] (u32)
    pub graph_index: Tensor,
    /// Targets: [num_graphs] (f32)
    pub targets: Tensor,
    /// Molecules in this batch
    pub num_graphs: usize,
}

impl MolecularBatch {
    /// Pack molecules into a batch, building each molecule's radius graph
    pub fn collate(molecules: &[&Molecule], cutoff: f64, device: &Device) -> Result<Self> {
        let mut atomic_numbers = Vec::new();
        let mut positions = Vec::new();
        let mut edge_src = Vec::new();
        let mut edge_dst = Vec::new();
        let mut graph_index = Vec::new();
        let mut targets = Vec::with_capacity(molecules.len());

        let mut offset = 0u32;
        for (g, molecule) in molecules.iter().enumerate() {
            atomic_numbers.extend_from_slice(&molecule.atomic_numbers);
            positions.extend(molecule.positions.iter().flat_map(|p| p.iter().copied()));
            graph_index.extend(std::iter::repeat(g as u32).take(molecule.num_atoms()));
            for (src, dst) in molecule.radius_edges(cutoff) {
                edge_src.push(offset + src as u32);
                edge_dst.push(offset + dst as u32);
            }
            targets.push(molecule.target);
            offset += molecule.num_atoms() as u32;
        }

        let num_atoms = atomic_numbers.len();
        let num_edges = edge_src.len();
        Ok(Self {
            atomic_numbers: Tensor::from_vec(atomic_numbers, num_atoms, device)?,
            positions: Tensor::from_vec(positions, (num_atoms, 3), device)?,
            edge_src: Tensor::from_vec(edge_src, num_edges, device)?,
            edge_dst: Tensor::from_vec(edge_dst, num_edges, device)?,
            graph_index: Tensor::from_vec(graph_index, num_atoms, device)?,
            targets: Tensor::from_vec(targets, molecules.len(), device)?,
            num_graphs: molecules.len(),
        })
    }
}

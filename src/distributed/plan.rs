//! Two-level partition tree: tile rows to nodes, then each node's rows to its devices.

use crate::error::{MosaicError, Result};
use crate::matching::partition::{RowRange, partition};
use log::debug;

/// Ranks are numbered node-major: `rank = node * devices_per_node + device`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    pub nodes: usize,
    pub devices_per_node: usize,
}

/// Device 0 of every node is its CPU engine; the rest are GPUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

impl Topology {
    pub fn new(nodes: usize, devices_per_node: usize) -> Result<Self> {
        if nodes == 0 || devices_per_node == 0 {
            return Err(MosaicError::InvalidConfig(format!(
                "topology needs at least one node and one device per node, got {nodes}x{devices_per_node}"
            )));
        }
        Ok(Self {
            nodes,
            devices_per_node,
        })
    }

    /// Total number of ranks.
    pub fn size(&self) -> usize {
        self.nodes * self.devices_per_node
    }

    pub fn rank(&self, node: usize, device: usize) -> usize {
        node * self.devices_per_node + device
    }

    /// `(node, device)` of `rank`.
    pub fn locate(&self, rank: usize) -> (usize, usize) {
        (rank / self.devices_per_node, rank % self.devices_per_node)
    }

    pub fn device_kind(&self, rank: usize) -> DeviceKind {
        match self.locate(rank).1 {
            0 => DeviceKind::Cpu,
            _ => DeviceKind::Gpu,
        }
    }
}

/// How a node's rows are split between its CPU (device 0) and its GPUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceAssignment {
    /// Partition rule across every device of the node.
    Even,
    /// The CPU gets nothing; the GPUs split the node's rows. A node without GPUs
    /// keeps everything on its CPU.
    #[default]
    GpuOnly,
    /// Each GPU takes `rows / gpus` rows when that is at least `min_rows_per_gpu`
    /// (and at least one), the CPU takes the remainder. When the remainder is zero and the GPUs have
    /// rows to spare, one row per GPU moves to the CPU so it is not left idle.
    /// Below the threshold the CPU takes everything.
    GpuThreshold { min_rows_per_gpu: usize },
}

impl DeviceAssignment {
    /// Row count of each device of a node with `rows` rows and `devices` devices.
    pub fn split(&self, rows: usize, devices: usize) -> Vec<usize> {
        let gpus = devices.saturating_sub(1);
        let mut counts = vec![0usize; devices];
        match *self {
            DeviceAssignment::Even => {
                for (count, range) in counts.iter_mut().zip(partition(rows, devices)) {
                    *count = range.len();
                }
            }
            _ if gpus == 0 => counts[0] = rows,
            DeviceAssignment::GpuOnly => {
                for (count, range) in counts[1..].iter_mut().zip(partition(rows, gpus)) {
                    *count = range.len();
                }
            }
            DeviceAssignment::GpuThreshold { min_rows_per_gpu } => {
                let per_gpu = rows / gpus;
                if per_gpu >= min_rows_per_gpu.max(1) {
                    let mut gpu_rows = per_gpu * gpus;
                    let mut cpu_rows = rows - gpu_rows;
                    if cpu_rows == 0 && per_gpu > min_rows_per_gpu.max(1) {
                        cpu_rows += gpus;
                        gpu_rows -= gpus;
                    }
                    counts[0] = cpu_rows;
                    for (count, range) in counts[1..].iter_mut().zip(partition(gpu_rows, gpus)) {
                        *count = range.len();
                    }
                } else {
                    counts[0] = rows;
                }
            }
        }
        counts
    }
}

/// Row ranges of every node and every rank for one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    total_rows: usize,
    topology: Topology,
    assignment: DeviceAssignment,
    nodes: Vec<RowRange>,
    ranks: Vec<RowRange>,
}

impl PartitionPlan {
    pub fn new(total_rows: usize, topology: Topology, assignment: DeviceAssignment) -> Result<Self> {
        let nodes = partition(total_rows, topology.nodes);
        let mut ranks = Vec::with_capacity(topology.size());
        for node in &nodes {
            let mut start = node.start;
            for rows in assignment.split(node.len(), topology.devices_per_node) {
                ranks.push(RowRange::new(start, start + rows));
                start += rows;
            }
        }

        let plan = Self {
            total_rows,
            topology,
            assignment,
            nodes,
            ranks,
        };
        plan.validate()?;
        debug!(
            "Partition plan for {} rows ({:?}): nodes {:?}, ranks {:?}",
            total_rows, assignment, plan.nodes, plan.ranks
        );
        Ok(plan)
    }

    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn assignment(&self) -> DeviceAssignment {
        self.assignment
    }

    pub fn node_range(&self, node: usize) -> RowRange {
        self.nodes[node]
    }

    pub fn rank_range(&self, rank: usize) -> RowRange {
        self.ranks[rank]
    }

    pub fn rank_ranges(&self) -> &[RowRange] {
        &self.ranks
    }

    /// Device ranges of every node must add up to that node's range, and node
    /// ranges to the whole image, each contiguous in rank order.
    pub fn validate(&self) -> Result<()> {
        let broken = |what: String| MosaicError::InvalidConfig(format!("partition plan: {what}"));
        if self.nodes.len() != self.topology.nodes || self.ranks.len() != self.topology.size() {
            return Err(broken(format!(
                "{} node and {} rank ranges for a {}x{} topology",
                self.nodes.len(),
                self.ranks.len(),
                self.topology.nodes,
                self.topology.devices_per_node
            )));
        }

        let mut next = 0;
        for (node, range) in self.nodes.iter().enumerate() {
            if range.start != next {
                return Err(broken(format!("node {node} starts at row {} instead of {next}", range.start)));
            }
            let devices = &self.ranks[node * self.topology.devices_per_node..][..self.topology.devices_per_node];
            let mut device_next = range.start;
            for (device, rank_range) in devices.iter().enumerate() {
                if rank_range.start != device_next {
                    return Err(broken(format!(
                        "device {device} of node {node} starts at row {} instead of {device_next}",
                        rank_range.start
                    )));
                }
                device_next = rank_range.end;
            }
            if device_next != range.end {
                return Err(broken(format!(
                    "devices of node {node} cover rows up to {device_next}, node ends at {}",
                    range.end
                )));
            }
            next = range.end;
        }
        if next != self.total_rows {
            return Err(broken(format!("nodes cover {next} of {} rows", self.total_rows)));
        }
        Ok(())
    }
}

//! Per-rank driver: local matching, metadata exchange, and the ordered gather.

use super::comm::{Communicator, LocalCluster};
use super::plan::{DeviceKind, PartitionPlan};
use crate::error::{MosaicError, Result};
use crate::image::{PixelBuffer, ReferenceCorpus};
use crate::matching::engine::TileMatcher;
use log::{debug, info};

#[derive(Debug, Clone, Copy)]
pub struct Coordinator<'p> {
    plan: &'p PartitionPlan,
}

impl<'p> Coordinator<'p> {
    pub fn new(plan: &'p PartitionPlan) -> Self {
        Self { plan }
    }

    /// Run one rank. The root returns the full row-major result; every other rank `None`.
    ///
    /// A failure on any rank, local or remote, fails every rank.
    pub fn run_rank<C: Communicator>(
        &self,
        comm: &C,
        matcher: &dyn TileMatcher,
        pixels: &PixelBuffer<'_>,
        corpus: &ReferenceCorpus<'_>,
    ) -> Result<Option<Vec<u32>>> {
        let result = self.exchange(comm, matcher, pixels, corpus);
        if let Err(e) = &result
            && !matches!(e, MosaicError::RankAborted { .. })
        {
            comm.abort(&e.to_string());
        }
        result
    }

    fn exchange<C: Communicator>(
        &self,
        comm: &C,
        matcher: &dyn TileMatcher,
        pixels: &PixelBuffer<'_>,
        corpus: &ReferenceCorpus<'_>,
    ) -> Result<Option<Vec<u32>>> {
        let grid = pixels.grid();
        if grid.rows != self.plan.total_rows() || comm.size() != self.plan.topology().size() {
            return Err(MosaicError::Communication(format!(
                "plan for {} rows over {} ranks used for {} rows over {} ranks",
                self.plan.total_rows(),
                self.plan.topology().size(),
                grid.rows,
                comm.size()
            )));
        }

        let range = self.plan.rank_range(comm.rank());
        let mut local = vec![0u32; range.len() * grid.cols];
        if !range.is_empty() {
            debug!(
                "Rank {} matching rows {:?} on {}",
                comm.rank(),
                range,
                matcher.name()
            );
            matcher.match_rows(&pixels.tile_rows(range), corpus, &mut local)?;
        }

        if !comm.is_root() {
            comm.send_row_count(range.len())?;
            comm.wait_release()?;
            comm.send_slice(local)?;
            return Ok(None);
        }

        // Gather layout: receive counts and offsets per rank, offsets following rank order.
        let mut rows = vec![0usize; comm.size()];
        rows[comm.rank()] = range.len();
        for (rank, count) in comm.collect_row_counts()? {
            let expected = self.plan.rank_range(rank).len();
            if count != expected {
                return Err(MosaicError::Communication(format!(
                    "rank {rank} reported {count} rows, its assignment has {expected}"
                )));
            }
            rows[rank] = count;
        }
        let counts: Vec<usize> = rows.iter().map(|r| r * grid.cols).collect();
        let displacements: Vec<usize> = counts
            .iter()
            .scan(0, |offset, &count| {
                let start = *offset;
                *offset += count;
                Some(start)
            })
            .collect();
        debug!("Gather counts {:?}, displacements {:?}", counts, displacements);
        comm.release()?;

        let mut gathered = vec![0u32; grid.len()];
        let mut place = |rank: usize, slice: &[u32]| -> Result<()> {
            if slice.len() != counts[rank] {
                return Err(MosaicError::Communication(format!(
                    "rank {rank} sent {} indices, expected {}",
                    slice.len(),
                    counts[rank]
                )));
            }
            gathered[displacements[rank]..][..slice.len()].copy_from_slice(slice);
            Ok(())
        };
        place(comm.rank(), &local)?;
        for (rank, slice) in comm.collect_slices()? {
            place(rank, &slice)?;
        }
        Ok(Some(gathered))
    }
}

/// Run every rank of `plan` on its own thread and return the gathered result.
///
/// `matcher_for` builds the engine of each rank from its device kind.
pub fn run_local_cluster<F>(
    plan: &PartitionPlan,
    pixels: &PixelBuffer<'_>,
    corpus: &ReferenceCorpus<'_>,
    matcher_for: F,
) -> Result<Vec<u32>>
where
    F: Fn(usize, DeviceKind) -> Result<Box<dyn TileMatcher>>,
{
    let topology = plan.topology();
    let matchers = (0..topology.size())
        .map(|rank| matcher_for(rank, topology.device_kind(rank)))
        .collect::<Result<Vec<_>>>()?;
    let comms = LocalCluster::new(topology.size())?;
    info!(
        "Running {} ranks ({} nodes x {} devices) over {} tile rows",
        topology.size(),
        topology.nodes,
        topology.devices_per_node,
        plan.total_rows()
    );

    let coordinator = Coordinator::new(plan);
    let results: Vec<Result<Option<Vec<u32>>>> = std::thread::scope(|scope| {
        let handles: Vec<_> = comms
            .into_iter()
            .zip(&matchers)
            .map(|(comm, matcher)| {
                scope.spawn(move || coordinator.run_rank(&comm, matcher.as_ref(), pixels, corpus))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
            .collect()
    });

    // Report the failure itself rather than the aborts and broken links it caused on
    // other ranks, whichever rank saw what first.
    let mut gathered = None;
    let mut failure: Option<MosaicError> = None;
    for result in results {
        match result {
            Ok(Some(indices)) => gathered = Some(indices),
            Ok(None) => {}
            Err(e) => {
                if failure.as_ref().is_none_or(|kept| severity(&e) > severity(kept)) {
                    failure = Some(e);
                }
            }
        }
    }
    if let Some(e) = failure {
        return Err(e);
    }
    gathered.ok_or_else(|| MosaicError::Communication("root rank returned no result".into()))
}

/// Rank of an error as an explanation of a failed run.
fn severity(error: &MosaicError) -> u8 {
    match error {
        MosaicError::Communication(_) => 0,
        MosaicError::RankAborted { .. } => 1,
        _ => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::plan::{DeviceAssignment, Topology};
    use crate::matching::cpu::CpuMatcher;
    use crate::test_support::{noise, noise_corpus};
    use std::time::Duration;

    struct Failing;

    impl TileMatcher for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn match_rows(&self, _: &PixelBuffer<'_>, _: &ReferenceCorpus<'_>, _: &mut [u32]) -> Result<()> {
            Err(MosaicError::device(
                "launch",
                crate::error::DeviceErrorKind::ResourceExhausted,
                "injected",
            ))
        }
    }

    /// CPU matcher that finishes its rows only after `delay`.
    struct Slow(CpuMatcher, Duration);

    impl TileMatcher for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        fn match_rows(&self, pixels: &PixelBuffer<'_>, corpus: &ReferenceCorpus<'_>, out: &mut [u32]) -> Result<()> {
            std::thread::sleep(self.1);
            self.0.match_rows(pixels, corpus, out)
        }
    }

    fn cpu(_: usize, _: DeviceKind) -> Result<Box<dyn TileMatcher>> {
        Ok(Box::new(CpuMatcher::new(1)?))
    }

    #[test]
    fn gathers_in_tile_order_for_every_assignment() {
        let data = noise(64 * 192 * 3, 30);
        let pixels = PixelBuffer::new(&data, 64, 192).unwrap();
        let corpus_bytes = noise_corpus(4, 12);
        let corpus = ReferenceCorpus::new(&corpus_bytes, 4).unwrap();

        let mut expected = vec![0u32; pixels.grid().len()];
        CpuMatcher::new(1).unwrap().match_rows(&pixels, &corpus, &mut expected).unwrap();

        let topology = Topology::new(2, 2).unwrap();
        for assignment in [
            DeviceAssignment::Even,
            DeviceAssignment::GpuOnly,
            DeviceAssignment::GpuThreshold { min_rows_per_gpu: 1 },
        ] {
            let plan = PartitionPlan::new(6, topology, assignment).unwrap();
            let gathered = run_local_cluster(&plan, &pixels, &corpus, cpu).unwrap();
            assert_eq!(gathered, expected, "{assignment:?}");
        }
    }

    #[test]
    fn a_failing_rank_fails_the_run() {
        let data = noise(32 * 128 * 3, 1);
        let pixels = PixelBuffer::new(&data, 32, 128).unwrap();
        let corpus_bytes = noise_corpus(2, 2);
        let corpus = ReferenceCorpus::new(&corpus_bytes, 2).unwrap();
        let plan = PartitionPlan::new(4, Topology::new(2, 2).unwrap(), DeviceAssignment::Even).unwrap();

        for failing_rank in [0, 3] {
            let result = run_local_cluster(&plan, &pixels, &corpus, |rank, kind| {
                if rank == failing_rank {
                    Ok(Box::new(Failing) as Box<dyn TileMatcher>)
                } else {
                    cpu(rank, kind)
                }
            });
            assert!(
                matches!(result, Err(MosaicError::DeviceOperation { .. })),
                "failing rank {failing_rank}: {result:?}"
            );
        }
    }

    #[test]
    fn a_late_rank_still_reports_the_device_failure() {
        let data = noise(32 * 128 * 3, 4);
        let pixels = PixelBuffer::new(&data, 32, 128).unwrap();
        let corpus_bytes = noise_corpus(2, 5);
        let corpus = ReferenceCorpus::new(&corpus_bytes, 2).unwrap();
        let plan = PartitionPlan::new(4, Topology::new(2, 2).unwrap(), DeviceAssignment::Even).unwrap();

        for _ in 0..5 {
            let result = run_local_cluster(&plan, &pixels, &corpus, |rank, kind| match rank {
                1 => Ok(Box::new(Slow(CpuMatcher::new(1)?, Duration::from_millis(300))) as Box<dyn TileMatcher>),
                3 => Ok(Box::new(Failing) as Box<dyn TileMatcher>),
                _ => cpu(rank, kind),
            });
            assert!(
                matches!(result, Err(MosaicError::DeviceOperation { .. })),
                "{result:?}"
            );
        }
    }

    #[test]
    fn root_cause_outranks_aborts_and_broken_links() {
        let device = MosaicError::device("launch", crate::error::DeviceErrorKind::DeviceLost, "lost");
        let aborted = MosaicError::RankAborted {
            rank: 3,
            reason: "lost".into(),
        };
        let link = MosaicError::Communication("rank 0 is gone".into());
        assert!(severity(&device) > severity(&aborted));
        assert!(severity(&aborted) > severity(&link));
    }

    #[test]
    fn mismatched_plans_are_rejected() {
        let data = noise(32 * 64 * 3, 1);
        let pixels = PixelBuffer::new(&data, 32, 64).unwrap();
        let corpus_bytes = noise_corpus(1, 2);
        let corpus = ReferenceCorpus::new(&corpus_bytes, 1).unwrap();
        let plan = PartitionPlan::new(5, Topology::new(1, 2).unwrap(), DeviceAssignment::Even).unwrap();
        assert!(run_local_cluster(&plan, &pixels, &corpus, cpu).is_err());
    }
}

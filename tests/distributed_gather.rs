mod common;

use common::{noise, noise_corpus};
use vulkan_photomosaic::device::HostDevice;
use vulkan_photomosaic::distributed::{DeviceAssignment, DeviceKind, PartitionPlan, Topology, run_local_cluster};
use vulkan_photomosaic::kernel::WorkGroupLayout;
use vulkan_photomosaic::{
    CpuMatcher, GpuMatcher, GpuScaling, MosaicConfig, MosaicEngine, MosaicError, PixelBuffer, ReferenceCorpus,
    TileMatcher,
};

fn mixed_matcher(_rank: usize, kind: DeviceKind) -> vulkan_photomosaic::Result<Box<dyn TileMatcher>> {
    Ok(match kind {
        DeviceKind::Cpu => Box::new(CpuMatcher::new(2)?),
        DeviceKind::Gpu => {
            let layout = WorkGroupLayout::new(64)?;
            Box::new(GpuMatcher::new(vec![HostDevice::new(layout)], GpuScaling::Fixed)?)
        }
    })
}

#[test]
fn two_nodes_gather_the_single_process_result() {
    let data = noise(160 * 224 * 3, 11);
    let pixels = PixelBuffer::new(&data, 160, 224).unwrap();
    let corpus_bytes = noise_corpus(5, 13);
    let corpus = ReferenceCorpus::new(&corpus_bytes, 5).unwrap();

    let engine = MosaicEngine::new(MosaicConfig::default().with_corpus_len(5).with_cpu_threads(3)).unwrap();
    let expected = engine.match_image(&pixels, &corpus).unwrap();

    let topology = Topology::new(2, 2).unwrap();
    for assignment in [
        DeviceAssignment::Even,
        DeviceAssignment::GpuOnly,
        DeviceAssignment::GpuThreshold { min_rows_per_gpu: 2 },
    ] {
        let plan = PartitionPlan::new(pixels.grid().rows, topology, assignment).unwrap();
        let gathered = run_local_cluster(&plan, &pixels, &corpus, mixed_matcher).unwrap();
        assert_eq!(gathered, expected, "{assignment:?}");
    }
}

#[test]
fn more_ranks_than_rows_still_covers_the_grid() {
    let data = noise(64 * 64 * 3, 21);
    let pixels = PixelBuffer::new(&data, 64, 64).unwrap();
    let corpus_bytes = noise_corpus(3, 4);
    let corpus = ReferenceCorpus::new(&corpus_bytes, 3).unwrap();

    let expected = CpuMatcher::new(1).unwrap();
    let mut single = vec![0u32; 4];
    expected.match_rows(&pixels, &corpus, &mut single).unwrap();

    let plan = PartitionPlan::new(2, Topology::new(3, 2).unwrap(), DeviceAssignment::Even).unwrap();
    let gathered = run_local_cluster(&plan, &pixels, &corpus, mixed_matcher).unwrap();
    assert_eq!(gathered, single);
}

#[test]
fn a_failing_gpu_rank_fails_the_whole_run() {
    let data = noise(64 * 128 * 3, 3);
    let pixels = PixelBuffer::new(&data, 64, 128).unwrap();
    let corpus_bytes = noise_corpus(2, 9);
    let corpus = ReferenceCorpus::new(&corpus_bytes, 2).unwrap();

    let plan = PartitionPlan::new(4, Topology::new(2, 2).unwrap(), DeviceAssignment::GpuOnly).unwrap();
    let result = run_local_cluster(&plan, &pixels, &corpus, |rank, kind| {
        if rank == 3 {
            let layout = WorkGroupLayout::new(32)?;
            let device = HostDevice::new(layout).fail_launch_of_row(0);
            return Ok(Box::new(GpuMatcher::new(vec![device], GpuScaling::Fixed)?) as Box<dyn TileMatcher>);
        }
        mixed_matcher(rank, kind)
    });
    assert!(matches!(result, Err(MosaicError::DeviceOperation { .. })), "{result:?}");
}

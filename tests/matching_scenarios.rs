mod common;

use common::{noise, noise_corpus};
use vulkan_photomosaic::device::HostDevice;
use vulkan_photomosaic::image::{interleaved_to_planar, planar_tile_at};
use vulkan_photomosaic::kernel::WorkGroupLayout;
use vulkan_photomosaic::matching::best_match;
use vulkan_photomosaic::{
    CpuMatcher, GpuMatcher, GpuScaling, MosaicConfig, MosaicEngine, PixelBuffer, ReferenceCorpus, TILE_BYTES,
    render_mosaic,
};

fn engine(entries: usize, threads: usize) -> MosaicEngine {
    MosaicEngine::new(
        MosaicConfig::default()
            .with_corpus_len(entries)
            .with_cpu_threads(threads),
    )
    .unwrap()
}

fn oracle(pixels: &PixelBuffer<'_>, corpus: &ReferenceCorpus<'_>) -> Vec<u32> {
    let grid = pixels.grid();
    (0..grid.len())
        .map(|slot| {
            let (row, col) = grid.position(slot);
            best_match(&planar_tile_at(pixels, row, col), corpus).index
        })
        .collect()
}

#[test]
fn tile_copied_into_the_corpus_matches_exactly() {
    let data = noise(64 * 64 * 3, 7);
    let pixels = PixelBuffer::new(&data, 64, 64).unwrap();
    let first_tile = planar_tile_at(&pixels, 0, 0);

    let mut corpus_bytes = vec![0u8; TILE_BYTES];
    corpus_bytes.extend(vec![255u8; TILE_BYTES]);
    corpus_bytes.extend(&first_tile);
    let corpus = ReferenceCorpus::new(&corpus_bytes, 3).unwrap();

    let indices = engine(3, 2).match_image(&pixels, &corpus).unwrap();
    assert_eq!(indices.len(), 4);
    assert_eq!(indices[0], 2);

    let found = best_match(&first_tile, &corpus);
    assert_eq!((found.index, found.distance), (2, 0));
}

#[test]
fn thread_count_does_not_change_the_result() {
    let data = noise(256 * 256 * 3, 42);
    let pixels = PixelBuffer::new(&data, 256, 256).unwrap();
    let corpus_bytes = noise_corpus(6, 3);
    let corpus = ReferenceCorpus::new(&corpus_bytes, 6).unwrap();

    let expected = oracle(&pixels, &corpus);
    for threads in [1, 4, 16] {
        let indices = engine(6, threads).match_image(&pixels, &corpus).unwrap();
        assert_eq!(indices, expected, "threads = {threads}");
    }
}

#[test]
fn every_slot_is_written_when_workers_outnumber_rows() {
    let data = noise(96 * 64 * 3, 5);
    let pixels = PixelBuffer::new(&data, 96, 64).unwrap();
    let corpus_bytes = noise_corpus(3, 8);
    let corpus = ReferenceCorpus::new(&corpus_bytes, 3).unwrap();

    for threads in [1, 2, 9] {
        let mut out = vec![u32::MAX; 6];
        CpuMatcher::new(threads).unwrap().match_rows(&pixels, &corpus, &mut out).unwrap();
        assert!(out.iter().all(|&index| index < 3), "threads = {threads}: {out:?}");
        assert_eq!(out, oracle(&pixels, &corpus));
    }
}

#[test]
fn identical_entries_resolve_to_the_lowest_index() {
    let data = vec![17u8; 32 * 32 * 3];
    let pixels = PixelBuffer::new(&data, 32, 32).unwrap();
    let mut corpus_bytes = vec![200u8; TILE_BYTES];
    corpus_bytes.extend(vec![17u8; TILE_BYTES]);
    corpus_bytes.extend(vec![17u8; TILE_BYTES]);
    let corpus = ReferenceCorpus::new(&corpus_bytes, 3).unwrap();

    assert_eq!(engine(3, 1).match_image(&pixels, &corpus).unwrap(), vec![1]);
}

#[test]
fn host_device_pipeline_matches_the_cpu_engine() {
    let data = noise(128 * 96 * 3, 19);
    let pixels = PixelBuffer::new(&data, 128, 96).unwrap();
    let corpus_bytes = noise_corpus(4, 23);
    let corpus = ReferenceCorpus::new(&corpus_bytes, 4).unwrap();
    let expected = engine(4, 3).match_image(&pixels, &corpus).unwrap();

    for threads in [32, 128] {
        let layout = WorkGroupLayout::new(threads).unwrap();
        let devices = vec![
            HostDevice::named("host-a", layout),
            HostDevice::named("host-b", layout),
        ];
        let gpu = GpuMatcher::new(devices, GpuScaling::Fixed).unwrap();
        let engine = MosaicEngine::new(
            MosaicConfig::default()
                .with_corpus_len(4)
                .with_work_group_size(threads)
                .with_cpu_fallback_grid(None),
        )
        .unwrap()
        .with_gpu(gpu);

        assert_eq!(engine.match_image(&pixels, &corpus).unwrap(), expected, "threads = {threads}");
    }
}

#[test]
fn rendered_mosaic_matches_back_to_its_indices() {
    let corpus_bytes = noise_corpus(5, 99);
    let corpus = ReferenceCorpus::new(&corpus_bytes, 5).unwrap();
    let data = noise(96 * 64 * 3, 1);
    let grid = PixelBuffer::new(&data, 96, 64).unwrap().grid();
    let indices: Vec<u32> = vec![4, 0, 3, 1, 1, 2];

    let mosaic = render_mosaic(&corpus, grid, &indices).unwrap();
    assert_eq!((mosaic.width(), mosaic.height()), (96, 64));

    let pixels = PixelBuffer::from_rgb_image(&mosaic).unwrap();
    assert_eq!(engine(5, 2).match_image(&pixels, &corpus).unwrap(), indices);

    let mut planar = vec![0u8; TILE_BYTES];
    interleaved_to_planar(&tile_bytes(&pixels, 0, 1), &mut planar);
    assert_eq!(planar, corpus.entry(0));
}

fn tile_bytes(pixels: &PixelBuffer<'_>, row: usize, col: usize) -> Vec<u8> {
    let span = 32 * 3;
    (0..32)
        .flat_map(|h| {
            let offset = (row * 32 + h) * pixels.stride() + col * span;
            pixels.data()[offset..offset + span].to_vec()
        })
        .collect()
}

#[test]
fn malformed_inputs_are_rejected() {
    assert!(PixelBuffer::new(&[0u8; 48 * 32 * 3], 48, 32).is_err());
    assert!(PixelBuffer::new(&[0u8; 10], 32, 32).is_err());
    assert!(ReferenceCorpus::new(&[0u8; TILE_BYTES + 1], 1).is_err());

    let data = noise(32 * 32 * 3, 2);
    let corpus_bytes = noise_corpus(2, 2);
    assert!(engine(3, 1).match_bytes(&data, 32, 32, &corpus_bytes).is_err());
}

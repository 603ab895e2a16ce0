//! Top-level entry point.

use crate::config::MosaicConfig;
use crate::error::{MosaicError, Result};
use crate::image::{PixelBuffer, ReferenceCorpus, TILE_BYTES, check_result_len};
use crate::kernel::WorkGroupLayout;
use crate::matching::cpu::CpuMatcher;
use log::{debug, info};

/// Something that fills a result array with one corpus index per tile.
///
/// `out` is row-major over the tile grid of `pixels`; implementations write every
/// slot exactly once.
pub trait TileMatcher: Send + Sync {
    fn name(&self) -> &str;

    fn match_rows(&self, pixels: &PixelBuffer<'_>, corpus: &ReferenceCorpus<'_>, out: &mut [u32]) -> Result<()>;
}

/// Validated configuration plus the engines it selects between.
pub struct MosaicEngine {
    config: MosaicConfig,
    layout: WorkGroupLayout,
    cpu: CpuMatcher,
    gpu: Option<Box<dyn TileMatcher>>,
}

impl std::fmt::Debug for MosaicEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MosaicEngine")
            .field("config", &self.config)
            .field("cpu", &self.cpu)
            .field("gpu", &self.gpu.as_ref().map(|gpu| gpu.name().to_string()))
            .finish()
    }
}

impl MosaicEngine {
    /// CPU-only engine.
    pub fn new(config: MosaicConfig) -> Result<Self> {
        let layout = config.validate()?;
        let cpu = CpuMatcher::new(config.cpu_threads)?;
        info!(
            "Mosaic engine ready: {} corpus entries, {} CPU threads",
            config.corpus_len, config.cpu_threads
        );
        Ok(Self {
            config,
            layout,
            cpu,
            gpu: None,
        })
    }

    /// Route large images through `gpu`; small ones stay on the CPU.
    pub fn with_gpu(mut self, gpu: impl TileMatcher + 'static) -> Self {
        info!("Mosaic engine using {} matcher for large images", gpu.name());
        self.gpu = Some(Box::new(gpu));
        self
    }

    /// Attach every Vulkan device found, compiling the kernel from `config.kernel_path`.
    #[cfg(feature = "vulkan")]
    pub fn with_vulkan(self) -> Result<Self> {
        let devices = crate::vulkan::VulkanComputeDevice::create_all(
            self.config.gpu_devices,
            &self.config.kernel_path,
            self.layout,
        )?;
        let gpu = crate::matching::gpu::GpuMatcher::new(devices, self.config.gpu_scaling)?;
        Ok(self.with_gpu(gpu))
    }

    pub fn config(&self) -> &MosaicConfig {
        &self.config
    }

    pub fn layout(&self) -> WorkGroupLayout {
        self.layout
    }

    pub fn has_gpu(&self) -> bool {
        self.gpu.is_some()
    }

    /// Matcher that would handle a `rows` x `cols` tile grid.
    pub fn matcher_for(&self, rows: usize, cols: usize) -> &dyn TileMatcher {
        match &self.gpu {
            Some(gpu) if !self.config.prefers_cpu(rows, cols) => gpu.as_ref(),
            _ => &self.cpu,
        }
    }

    /// Fill `out` with the best corpus index of every tile of `pixels`.
    pub fn run(&self, pixels: &PixelBuffer<'_>, corpus: &ReferenceCorpus<'_>, out: &mut [u32]) -> Result<()> {
        if corpus.len() != self.config.corpus_len {
            return Err(MosaicError::CorpusSize {
                expected: self.config.corpus_len * TILE_BYTES,
                actual: corpus.as_bytes().len(),
                entries: self.config.corpus_len,
            });
        }
        let grid = pixels.grid();
        check_result_len(grid, out)?;

        let matcher = self.matcher_for(grid.rows, grid.cols);
        debug!(
            "Matching {}x{} tiles against {} entries on {}",
            grid.rows,
            grid.cols,
            corpus.len(),
            matcher.name()
        );
        matcher.match_rows(pixels, corpus, out)
    }

    pub fn match_image(&self, pixels: &PixelBuffer<'_>, corpus: &ReferenceCorpus<'_>) -> Result<Vec<u32>> {
        let mut out = vec![0u32; pixels.grid().len()];
        self.run(pixels, corpus, &mut out)?;
        Ok(out)
    }

    /// Wrap raw buffers and match them.
    pub fn match_bytes(&self, pixels: &[u8], width: u32, height: u32, corpus: &[u8]) -> Result<Vec<u32>> {
        let pixels = PixelBuffer::new(pixels, width, height)?;
        let corpus = ReferenceCorpus::new(corpus, self.config.corpus_len)?;
        self.match_image(&pixels, &corpus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GpuScaling;
    use crate::device::HostDevice;
    use crate::matching::gpu::GpuMatcher;
    use crate::test_support::{noise, noise_corpus};

    fn config(entries: usize) -> MosaicConfig {
        MosaicConfig::default()
            .with_corpus_len(entries)
            .with_cpu_threads(3)
            .with_work_group_size(32)
    }

    #[test]
    fn rejects_a_corpus_of_the_wrong_size() {
        let engine = MosaicEngine::new(config(4)).unwrap();
        let data = noise(32 * 32 * 3, 1);
        let pixels = PixelBuffer::new(&data, 32, 32).unwrap();
        let corpus_bytes = noise_corpus(3, 1);
        let corpus = ReferenceCorpus::new(&corpus_bytes, 3).unwrap();
        assert!(matches!(
            engine.match_image(&pixels, &corpus),
            Err(MosaicError::CorpusSize { entries: 4, .. })
        ));
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        assert!(matches!(
            MosaicEngine::new(config(4).with_work_group_size(96)),
            Err(MosaicError::InvalidWorkGroup { threads: 96, .. })
        ));
    }

    #[test]
    fn small_grids_fall_back_to_the_cpu() {
        let layout = WorkGroupLayout::new(32).unwrap();
        let gpu = GpuMatcher::new(vec![HostDevice::new(layout)], GpuScaling::Fixed).unwrap();
        let engine = MosaicEngine::new(config(2)).unwrap().with_gpu(gpu);

        assert_eq!(engine.matcher_for(2, 2).name(), "cpu");
        assert_eq!(engine.matcher_for(8, 1).name(), "gpu");

        let data = noise(64 * 64 * 3, 5);
        let corpus_bytes = noise_corpus(2, 8);
        let indices = engine.match_bytes(&data, 64, 64, &corpus_bytes).unwrap();
        assert_eq!(indices.len(), 4);
    }

    #[test]
    fn gpu_and_cpu_paths_agree() {
        let layout = WorkGroupLayout::new(64).unwrap();
        let gpu = GpuMatcher::new(vec![HostDevice::new(layout)], GpuScaling::Fixed).unwrap();
        let cpu_only = MosaicEngine::new(config(3)).unwrap();
        let with_gpu = MosaicEngine::new(config(3).with_cpu_fallback_grid(None))
            .unwrap()
            .with_gpu(gpu);

        let data = noise(64 * 96 * 3, 13);
        let corpus_bytes = noise_corpus(3, 2);
        assert_eq!(
            cpu_only.match_bytes(&data, 64, 96, &corpus_bytes).unwrap(),
            with_gpu.match_bytes(&data, 64, 96, &corpus_bytes).unwrap()
        );
    }
}

//! Multi-device GPU engine.
//!
//! Tile rows are split across devices with the same partition rule used everywhere
//! else; every device runs its own [`ResourceManager`] on a dedicated thread and
//! writes only its own block of the result.

use crate::config::GpuScaling;
use crate::device::{ComputeDevice, ResourceManager};
use crate::error::{MosaicError, Result};
use crate::image::{PixelBuffer, ReferenceCorpus, check_result_len};
use crate::matching::engine::TileMatcher;
use crate::matching::partition::partition;
use log::{debug, info};

pub struct GpuMatcher<D: ComputeDevice> {
    devices: Vec<D>,
    scaling: GpuScaling,
}

impl<D: ComputeDevice> std::fmt::Debug for GpuMatcher<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.devices.iter().map(ComputeDevice::name).collect();
        f.debug_struct("GpuMatcher")
            .field("devices", &names)
            .field("scaling", &self.scaling)
            .finish()
    }
}

impl<D: ComputeDevice> GpuMatcher<D> {
    pub fn new(devices: Vec<D>, scaling: GpuScaling) -> Result<Self> {
        if devices.is_empty() {
            return Err(MosaicError::NoDeviceFound);
        }
        info!(
            "GPU matcher over {} device(s): {}",
            devices.len(),
            devices.iter().map(ComputeDevice::name).collect::<Vec<_>>().join(", ")
        );
        Ok(Self { devices, scaling })
    }

    pub fn devices(&self) -> &[D] {
        &self.devices
    }

    /// Devices that would take part for an image with `tile_rows` rows.
    pub fn active_devices(&self, tile_rows: usize) -> usize {
        self.scaling
            .devices_for(self.devices.len(), tile_rows)
            .min(self.devices.len())
    }

    pub fn match_rows(&self, pixels: &PixelBuffer<'_>, corpus: &ReferenceCorpus<'_>, out: &mut [u32]) -> Result<()> {
        let grid = pixels.grid();
        check_result_len(grid, out)?;
        let active = self.active_devices(grid.rows);
        let ranges = partition(grid.rows, active);
        debug!("GPU partition of {} tile rows over {} device(s): {:?}", grid.rows, active, ranges);

        let mut rest = out;
        let mut jobs = Vec::with_capacity(active);
        for (device, range) in self.devices.iter().zip(ranges) {
            let (block, tail) = std::mem::take(&mut rest).split_at_mut(range.len() * grid.cols);
            rest = tail;
            if !range.is_empty() {
                jobs.push((device, pixels.tile_rows(range), block));
            }
        }

        let results: Vec<Result<()>> = std::thread::scope(|scope| {
            let handles: Vec<_> = jobs
                .into_iter()
                .map(|(device, rows, block)| {
                    scope.spawn(move || ResourceManager::new(device).run(&rows, corpus, block))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        });

        results.into_iter().collect()
    }
}

impl<D: ComputeDevice> TileMatcher for GpuMatcher<D> {
    fn name(&self) -> &str {
        "gpu"
    }

    fn match_rows(&self, pixels: &PixelBuffer<'_>, corpus: &ReferenceCorpus<'_>, out: &mut [u32]) -> Result<()> {
        GpuMatcher::match_rows(self, pixels, corpus, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDevice;
    use crate::kernel::WorkGroupLayout;
    use crate::matching::cpu::CpuMatcher;
    use crate::test_support::{noise, noise_corpus};

    fn devices(count: usize) -> Vec<HostDevice> {
        let layout = WorkGroupLayout::new(32).unwrap();
        (0..count)
            .map(|i| HostDevice::named(format!("host-device-{i}"), layout))
            .collect()
    }

    #[test]
    fn multi_device_result_equals_cpu_result() {
        let data = noise(96 * 160 * 3, 21);
        let pixels = PixelBuffer::new(&data, 96, 160).unwrap();
        let corpus_bytes = noise_corpus(3, 6);
        let corpus = ReferenceCorpus::new(&corpus_bytes, 3).unwrap();
        let grid = pixels.grid();

        let mut expected = vec![0u32; grid.len()];
        CpuMatcher::new(2).unwrap().match_rows(&pixels, &corpus, &mut expected).unwrap();

        let matcher = GpuMatcher::new(devices(3), GpuScaling::Fixed).unwrap();
        let mut out = vec![u32::MAX; grid.len()];
        matcher.match_rows(&pixels, &corpus, &mut out).unwrap();
        assert_eq!(out, expected);
        assert!(matcher.devices().iter().all(|d| d.live_allocations() == 0));
    }

    #[test]
    fn more_devices_than_rows_leaves_extras_idle() {
        let data = noise(32 * 64 * 3, 2);
        let pixels = PixelBuffer::new(&data, 32, 64).unwrap();
        let corpus_bytes = noise_corpus(2, 3);
        let corpus = ReferenceCorpus::new(&corpus_bytes, 2).unwrap();

        let matcher = GpuMatcher::new(devices(4), GpuScaling::Fixed).unwrap();
        let mut out = vec![u32::MAX; 2];
        matcher.match_rows(&pixels, &corpus, &mut out).unwrap();
        assert!(out.iter().all(|&i| i < 2));
        assert_eq!(matcher.devices()[2].total_allocations(), 0);
        assert_eq!(matcher.devices()[3].total_allocations(), 0);
    }

    #[test]
    fn short_images_use_fewer_devices() {
        let matcher = GpuMatcher::new(devices(16), GpuScaling::default()).unwrap();
        assert_eq!(matcher.active_devices(30), 16);
        assert_eq!(matcher.active_devices(20), 4);
        assert_eq!(matcher.active_devices(4), 1);
    }

    #[test]
    fn no_devices_is_an_error() {
        assert!(matches!(
            GpuMatcher::<HostDevice>::new(Vec::new(), GpuScaling::Fixed),
            Err(MosaicError::NoDeviceFound)
        ));
    }
}

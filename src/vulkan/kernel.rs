//! Runtime compilation of the tile matching kernel and its compute pipeline.

use super::device_error;
use crate::error::{MosaicError, Result};
use crate::kernel::WorkGroupLayout;
use ash::{Device, vk};
use log::{debug, error};
use std::path::Path;

/// Push constants read by `kernels/tile_match.comp`.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct TileMatchParams {
    pub width: u32,
    pub columns: u32,
    pub corpus_len: u32,
}

/// Compile the GLSL source at `path` to SPIR-V with `WORKGROUP_SIZE` set from `layout`.
///
/// A failed build logs the complete compiler output for `device` and returns it.
pub fn compile_kernel(path: &Path, layout: WorkGroupLayout, device: &str) -> Result<Vec<u32>> {
    let source = std::fs::read_to_string(path)?;
    let build_failed = |log: String| {
        error!("Kernel build log for {}:\n{}", device, log);
        MosaicError::KernelBuild {
            device: device.to_string(),
            log,
        }
    };

    let compiler = shaderc::Compiler::new().map_err(|e| build_failed(e.to_string()))?;
    let mut options = shaderc::CompileOptions::new().map_err(|e| build_failed(e.to_string()))?;
    options.add_macro_definition("WORKGROUP_SIZE", Some(&layout.threads().to_string()));
    options.set_target_env(shaderc::TargetEnv::Vulkan, shaderc::EnvVersion::Vulkan1_2 as u32);

    let file_name = path.display().to_string();
    let artifact = compiler
        .compile_into_spirv(&source, shaderc::ShaderKind::Compute, &file_name, "main", Some(&options))
        .map_err(|e| build_failed(e.to_string()))?;
    if artifact.get_num_warnings() > 0 {
        debug!("Kernel build warnings for {}:\n{}", device, artifact.get_warning_messages());
    }
    Ok(artifact.as_binary().to_vec())
}

/// Descriptor layout (corpus, row, indices), push constants and pipeline of the kernel.
pub struct KernelPipeline {
    device: Device,
    pub descriptor_set_layout: vk::DescriptorSetLayout,
    pub pipeline_layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
}

impl std::fmt::Debug for KernelPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelPipeline")
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

impl KernelPipeline {
    pub fn new(device: &Device, spirv: &[u32]) -> Result<Self> {
        let pipeline_error = |e: vk::Result| device_error("build", e);

        let bindings: Vec<_> = (0..3)
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
            })
            .collect();
        let descriptor_set_layout = unsafe {
            device.create_descriptor_set_layout(&vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings), None)
        }
        .map_err(pipeline_error)?;

        let push_constant_ranges = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(size_of::<TileMatchParams>() as u32)];
        let set_layouts = [descriptor_set_layout];
        let pipeline_layout = unsafe {
            device.create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::default()
                    .set_layouts(&set_layouts)
                    .push_constant_ranges(&push_constant_ranges),
                None,
            )
        };
        let pipeline_layout = match pipeline_layout {
            Ok(layout) => layout,
            Err(e) => {
                unsafe { device.destroy_descriptor_set_layout(descriptor_set_layout, None) };
                return Err(pipeline_error(e));
            }
        };

        let mut pipeline = Self {
            device: device.clone(),
            descriptor_set_layout,
            pipeline_layout,
            pipeline: vk::Pipeline::null(),
        };

        let shader_module =
            unsafe { device.create_shader_module(&vk::ShaderModuleCreateInfo::default().code(spirv), None) }
                .map_err(pipeline_error)?;
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader_module)
            .name(c"main");
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(pipeline_layout);
        let created =
            unsafe { device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None) };
        unsafe { device.destroy_shader_module(shader_module, None) };

        pipeline.pipeline = created.map_err(|(_, e)| pipeline_error(e))?[0];
        Ok(pipeline)
    }
}

impl Drop for KernelPipeline {
    fn drop(&mut self) {
        unsafe {
            if self.pipeline != vk::Pipeline::null() {
                self.device.destroy_pipeline(self.pipeline, None);
            }
            self.device.destroy_pipeline_layout(self.pipeline_layout, None);
            self.device
                .destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        }
    }
}

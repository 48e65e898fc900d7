//! GPU backend.
//!
//! All state lives in device buffers for the whole run. Commands of one
//! iteration are recorded into a single encoder and submitted when the next
//! iteration starts, after the iteration counter in the params uniform has
//! been updated. Fields and receiver samples are only copied back to the grid
//! by [`LeapfrogStep::with_fields`] and [`LeapfrogStep::finish`].

mod codegen;
mod data;
mod util;

use std::{
    num::NonZeroU64,
    sync::Arc,
};

use nalgebra::Vector3;
use wgpu::util::DeviceExt;

use self::{
    codegen::{
        KernelKey,
        KernelKind,
        ShaderCache,
    },
    data::{
        ParamsData,
        PmlCorrectionRef,
        PmlParamsData,
        PmlTable,
        SourceTable,
    },
    util::{
        ComputeLimits,
        read_buffer,
    },
};
use crate::{
    admission::DeviceInfo,
    error::Error,
    grid::{
        FieldArrays,
        FieldComponent,
        Grid,
    },
    solver::{
        LeapfrogStep,
        SolverBackend,
    },
};

/// Storage buffers are never smaller than the largest element type the
/// kernels read from them.
const MIN_STORAGE_BUFFER_SIZE: usize = 32;

#[derive(Clone, Debug)]
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    device_info: DeviceInfo,
    limits: ComputeLimits,
    max_storage_buffer_binding_size: u64,
    layouts: Layouts,
    shaders: Arc<ShaderCache>,
}

impl WgpuBackend {
    pub fn new(device: &wgpu::Device, queue: &wgpu::Queue, device_info: DeviceInfo) -> Self {
        let device_limits = device.limits();
        let limits = ComputeLimits::from_limits(&device_limits);

        Self {
            device: device.clone(),
            queue: queue.clone(),
            device_info,
            limits,
            max_storage_buffer_binding_size: device_limits
                .max_storage_buffer_binding_size
                .into(),
            layouts: Layouts::new(device),
            shaders: Default::default(),
        }
    }

    /// Requests the default adapter and a device with its full limits.
    ///
    /// wgpu doesn't report how much memory the device has, so the caller has
    /// to supply it for the admission check.
    pub fn request(total_memory: u64) -> Result<Self, Error> {
        let instance = wgpu::Instance::new(&Default::default());

        pollster::block_on(async {
            let adapter = instance
                .request_adapter(&Default::default())
                .await
                .map_err(|error| Error::Device(error.to_string()))?;
            let (device, queue) = adapter
                .request_device(&wgpu::DeviceDescriptor {
                    label: Some("gpr-fdtd"),
                    required_limits: adapter.limits(),
                    ..Default::default()
                })
                .await
                .map_err(|error| Error::Device(error.to_string()))?;

            let device_info = DeviceInfo::from_wgpu(0, &adapter, total_memory);
            tracing::info!(device = %device_info.name, "using gpu");

            Ok(Self::new(&device, &queue, device_info))
        })
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// Number of shader modules currently alive.
    pub fn num_cached_kernels(&self) -> usize {
        self.shaders.len()
    }

    fn check_binding_size(&self, label: &str, size: usize) -> Result<(), Error> {
        if size as u64 > self.max_storage_buffer_binding_size {
            return Err(Error::Device(format!(
                "{label} needs a {} buffer, but device {} - {} only supports {}",
                crate::util::format_size(size as u64),
                self.device_info.id,
                self.device_info.name,
                crate::util::format_size(self.max_storage_buffer_binding_size),
            )));
        }
        Ok(())
    }

    fn create_buffer(&self, label: &str, contents: &[u8], usage: wgpu::BufferUsages) -> wgpu::Buffer {
        let padded;
        let contents = if contents.len() < MIN_STORAGE_BUFFER_SIZE {
            padded = {
                let mut padded = contents.to_vec();
                padded.resize(MIN_STORAGE_BUFFER_SIZE, 0);
                padded
            };
            &padded
        }
        else {
            contents
        };

        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents,
                usage,
            })
    }
}

impl SolverBackend for WgpuBackend {
    type Instance<'a> = WgpuSolverInstance<'a>;

    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn device_info(&self) -> Option<&DeviceInfo> {
        Some(&self.device_info)
    }

    fn create_instance<'a>(&'a self, grid: &'a mut Grid) -> Result<WgpuSolverInstance<'a>, Error> {
        WgpuSolverInstance::new(self, grid)
    }
}

/// Bind group and pipeline layouts shared by all instances.
///
/// Group 0 is the grid: params, coefficients, fields and edge IDs. Group 1
/// depends on the kernel.
#[derive(Clone, Debug)]
struct Layouts {
    grid: wgpu::BindGroupLayout,
    update: wgpu::BindGroupLayout,
    sources: wgpu::BindGroupLayout,
    pml: wgpu::BindGroupLayout,
    update_pipeline: wgpu::PipelineLayout,
    sources_pipeline: wgpu::PipelineLayout,
    pml_pipeline: wgpu::PipelineLayout,
}

impl Layouts {
    fn new(device: &wgpu::Device) -> Self {
        let bind_group_layout_entry = |binding, ty, has_dynamic_offset| {
            wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty,
                    has_dynamic_offset,
                    min_binding_size: None,
                },
                count: None,
            }
        };
        let uniform = wgpu::BufferBindingType::Uniform;
        let read_only = wgpu::BufferBindingType::Storage { read_only: true };
        let read_write = wgpu::BufferBindingType::Storage { read_only: false };

        let create_bind_group_layout = |label, entries: &[wgpu::BindGroupLayoutEntry]| {
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(label),
                entries,
            })
        };

        let grid = create_bind_group_layout(
            "gpr-fdtd/bind_group_layout/grid",
            &[
                bind_group_layout_entry(0, uniform, false),
                bind_group_layout_entry(1, uniform, false),
                bind_group_layout_entry(2, read_write, false),
                bind_group_layout_entry(3, read_only, false),
            ],
        );
        let update = create_bind_group_layout(
            "gpr-fdtd/bind_group_layout/update",
            &[
                bind_group_layout_entry(0, read_only, false),
                bind_group_layout_entry(1, read_write, false),
            ],
        );
        let sources = create_bind_group_layout(
            "gpr-fdtd/bind_group_layout/sources",
            &[
                bind_group_layout_entry(0, read_only, false),
                bind_group_layout_entry(1, read_only, false),
                bind_group_layout_entry(2, read_only, false),
                bind_group_layout_entry(3, read_write, false),
            ],
        );
        let pml = create_bind_group_layout(
            "gpr-fdtd/bind_group_layout/pml",
            &[
                bind_group_layout_entry(0, uniform, true),
                bind_group_layout_entry(1, read_only, false),
                bind_group_layout_entry(2, read_write, false),
            ],
        );

        let create_pipeline_layout = |label, second: &wgpu::BindGroupLayout| {
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(label),
                bind_group_layouts: &[&grid, second],
                push_constant_ranges: &[],
            })
        };
        let update_pipeline = create_pipeline_layout("gpr-fdtd/pipeline_layout/update", &update);
        let sources_pipeline =
            create_pipeline_layout("gpr-fdtd/pipeline_layout/sources", &sources);
        let pml_pipeline = create_pipeline_layout("gpr-fdtd/pipeline_layout/pml", &pml);

        Self {
            grid,
            update,
            sources,
            pml,
            update_pipeline,
            sources_pipeline,
            pml_pipeline,
        }
    }
}

#[derive(Debug)]
struct Buffers {
    params: wgpu::Buffer,
    fields: wgpu::Buffer,
    receiver_samples: wgpu::Buffer,
}

/// Everything a step needs to record its dispatches.
#[derive(Debug)]
struct Kernels {
    grid_bind_group: wgpu::BindGroup,
    update_bind_group: wgpu::BindGroup,
    sources_bind_group: wgpu::BindGroup,
    pml_bind_group: wgpu::BindGroup,

    update_magnetic: wgpu::ComputePipeline,
    update_electric: wgpu::ComputePipeline,
    /// Phase A and B, if there are dispersive materials.
    update_electric_dispersive: Option<(wgpu::ComputePipeline, wgpu::ComputePipeline)>,
    update_magnetic_sources: wgpu::ComputePipeline,
    update_electric_sources: wgpu::ComputePipeline,
    store_outputs: wgpu::ComputePipeline,
    update_pml: wgpu::ComputePipeline,

    node_dispatch: Vector3<u32>,
    receiver_dispatch: Option<Vector3<u32>>,
    electric_pml: Vec<PmlDispatch>,
    magnetic_pml: Vec<PmlDispatch>,
    num_electric_sources: usize,
    num_magnetic_sources: usize,

    /// Keeps the modules in the backend's cache.
    _modules: Vec<Arc<wgpu::ShaderModule>>,
}

#[derive(Clone, Copy, Debug)]
struct PmlDispatch {
    offset: u32,
    num_workgroups: Vector3<u32>,
}

#[derive(derive_more::Debug)]
pub struct WgpuSolverInstance<'a> {
    backend: &'a WgpuBackend,
    #[debug(skip)]
    grid: &'a mut Grid,
    buffers: Buffers,
    kernels: Kernels,
    params: ParamsData,
    #[debug(skip)]
    encoder: Option<wgpu::CommandEncoder>,
}

impl<'a> WgpuSolverInstance<'a> {
    fn new(backend: &'a WgpuBackend, grid: &'a mut Grid) -> Result<Self, Error> {
        let coefficients = grid.coefficients_or_err()?;
        let poles = coefficients.max_poles;
        if poles > 0 && grid.dispersive_state().is_none() {
            return Err(Error::NotPrepared);
        }

        let sources = SourceTable::new(grid, backend.name())?;
        let pml = PmlTable::new(grid);
        let params = ParamsData::new(grid, &sources);

        let num_nodes = grid.num_nodes();
        let num_receivers = grid.receivers().len();
        let iterations = grid.iterations();
        let accumulators = data::accumulators(grid);

        backend.check_binding_size("fields", 6 * num_nodes * size_of::<f32>())?;
        backend.check_binding_size("edge IDs", 6 * num_nodes * size_of::<u32>())?;
        backend.check_binding_size(
            "dispersive accumulators",
            accumulators.len() * size_of::<[f32; 2]>(),
        )?;
        backend.check_binding_size(
            "receiver samples",
            num_receivers * iterations * 6 * size_of::<f32>(),
        )?;
        backend.check_binding_size("pml auxiliary arrays", pml.phi.len() * size_of::<f32>())?;

        // modules
        let nodes = grid.nodes().cast::<u32>();
        let key = |kind| {
            KernelKey {
                kind,
                nodes: nodes.into(),
                num_materials: coefficients.num_materials() as u32,
                poles: poles as u32,
            }
        };
        let device = &backend.device;
        let update_module = backend.shaders.get(device, key(KernelKind::Update));
        let sources_module = backend.shaders.get(device, key(KernelKind::Sources));
        let pml_module = backend.shaders.get(device, key(KernelKind::Pml));

        // buffers
        let storage = wgpu::BufferUsages::STORAGE;
        let params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("gpr-fdtd/params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let coefficients_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("gpr-fdtd/coefficients"),
            contents: bytemuck::cast_slice(&data::coefficient_rows(coefficients)),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let fields_buffer = backend.create_buffer(
            "gpr-fdtd/fields",
            bytemuck::cast_slice(&data::fields(grid)),
            storage | wgpu::BufferUsages::COPY_SRC,
        );
        let ids_buffer = backend.create_buffer(
            "gpr-fdtd/ids",
            bytemuck::cast_slice(grid.ids().as_slice()),
            storage,
        );
        let dispersive_buffer = backend.create_buffer(
            "gpr-fdtd/dispersive",
            bytemuck::cast_slice(&data::dispersive_coefficients(coefficients)),
            storage,
        );
        let accumulators_buffer = backend.create_buffer(
            "gpr-fdtd/accumulators",
            bytemuck::cast_slice(&accumulators),
            storage,
        );
        let sources_buffer = backend.create_buffer(
            "gpr-fdtd/sources",
            bytemuck::cast_slice(&sources.sources),
            storage,
        );
        let waveforms_buffer = backend.create_buffer(
            "gpr-fdtd/waveforms",
            bytemuck::cast_slice(&sources.waveforms),
            storage,
        );
        let receiver_nodes = grid
            .receivers()
            .iter()
            .map(|receiver| grid.ids().strider().index_unchecked(&receiver.position) as u32)
            .collect::<Vec<_>>();
        let receiver_nodes_buffer = backend.create_buffer(
            "gpr-fdtd/receiver_nodes",
            bytemuck::cast_slice(&receiver_nodes),
            storage,
        );
        let receiver_samples = grid
            .receivers()
            .iter()
            .flat_map(|receiver| receiver.samples.iter().flatten())
            .copied()
            .collect::<Vec<f32>>();
        let receiver_samples_buffer = backend.create_buffer(
            "gpr-fdtd/receiver_samples",
            bytemuck::cast_slice(&receiver_samples),
            storage | wgpu::BufferUsages::COPY_SRC,
        );

        let pml_stride = backend.limits.uniform_stride(size_of::<PmlParamsData>());
        let mut pml_params = vec![0u8; pml_stride as usize * pml.params.len().max(1)];
        for (i, params) in pml.params.iter().enumerate() {
            let offset = i * pml_stride as usize;
            pml_params[offset..offset + size_of::<PmlParamsData>()]
                .copy_from_slice(bytemuck::bytes_of(params));
        }
        let pml_params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("gpr-fdtd/pml/params"),
            contents: &pml_params,
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let pml_profiles_buffer = backend.create_buffer(
            "gpr-fdtd/pml/profiles",
            bytemuck::cast_slice(&pml.profiles),
            storage,
        );
        let pml_phi_buffer = backend.create_buffer(
            "gpr-fdtd/pml/phi",
            bytemuck::cast_slice(&pml.phi),
            storage,
        );

        // bind groups
        let create_bind_group = |label, layout, buffers: &[wgpu::BindingResource]| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label),
                layout,
                entries: &buffers
                    .iter()
                    .enumerate()
                    .map(|(binding, resource)| {
                        wgpu::BindGroupEntry {
                            binding: binding as u32,
                            resource: resource.clone(),
                        }
                    })
                    .collect::<Vec<_>>(),
            })
        };
        let layouts = &backend.layouts;
        let grid_bind_group = create_bind_group(
            "gpr-fdtd/bind_group/grid",
            &layouts.grid,
            &[
                params_buffer.as_entire_binding(),
                coefficients_buffer.as_entire_binding(),
                fields_buffer.as_entire_binding(),
                ids_buffer.as_entire_binding(),
            ],
        );
        let update_bind_group = create_bind_group(
            "gpr-fdtd/bind_group/update",
            &layouts.update,
            &[
                dispersive_buffer.as_entire_binding(),
                accumulators_buffer.as_entire_binding(),
            ],
        );
        let sources_bind_group = create_bind_group(
            "gpr-fdtd/bind_group/sources",
            &layouts.sources,
            &[
                sources_buffer.as_entire_binding(),
                waveforms_buffer.as_entire_binding(),
                receiver_nodes_buffer.as_entire_binding(),
                receiver_samples_buffer.as_entire_binding(),
            ],
        );
        let pml_bind_group = create_bind_group(
            "gpr-fdtd/bind_group/pml",
            &layouts.pml,
            &[
                wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &pml_params_buffer,
                    offset: 0,
                    size: NonZeroU64::new(size_of::<PmlParamsData>() as u64),
                }),
                pml_profiles_buffer.as_entire_binding(),
                pml_phi_buffer.as_entire_binding(),
            ],
        );

        // pipelines
        let limits = &backend.limits;
        let workgroup_size = limits.work_group_size_for(num_nodes);
        tracing::debug!(?workgroup_size, num_nodes, "workgroup size");

        let shader_constants = [
            ("workgroup_size_x", workgroup_size.x.into()),
            ("workgroup_size_y", workgroup_size.y.into()),
            ("workgroup_size_z", workgroup_size.z.into()),
        ];
        let create_pipeline = |label, layout, module, entry_point| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(layout),
                module,
                entry_point: Some(entry_point),
                compilation_options: wgpu::PipelineCompilationOptions {
                    constants: &shader_constants,
                    zero_initialize_workgroup_memory: true,
                },
                cache: None,
            })
        };

        let update_magnetic = create_pipeline(
            "gpr-fdtd/update_magnetic",
            &layouts.update_pipeline,
            &*update_module,
            "update_magnetic",
        );
        let update_electric = create_pipeline(
            "gpr-fdtd/update_electric",
            &layouts.update_pipeline,
            &*update_module,
            "update_electric",
        );
        let update_electric_dispersive = (poles > 0).then(|| {
            (
                create_pipeline(
                    "gpr-fdtd/update_electric_dispersive_a",
                    &layouts.update_pipeline,
                    &*update_module,
                    "update_electric_dispersive_a",
                ),
                create_pipeline(
                    "gpr-fdtd/update_electric_dispersive_b",
                    &layouts.update_pipeline,
                    &*update_module,
                    "update_electric_dispersive_b",
                ),
            )
        });
        let update_magnetic_sources = create_pipeline(
            "gpr-fdtd/update_magnetic_sources",
            &layouts.sources_pipeline,
            &*sources_module,
            "update_magnetic_sources",
        );
        let update_electric_sources = create_pipeline(
            "gpr-fdtd/update_electric_sources",
            &layouts.sources_pipeline,
            &*sources_module,
            "update_electric_sources",
        );
        let store_outputs = create_pipeline(
            "gpr-fdtd/store_outputs",
            &layouts.sources_pipeline,
            &*sources_module,
            "store_outputs",
        );
        let update_pml = create_pipeline(
            "gpr-fdtd/update_pml",
            &layouts.pml_pipeline,
            &*pml_module,
            "update_pml",
        );

        // dispatches
        let node_dispatch = limits.dispatch_for(num_nodes, &workgroup_size)?;
        let receiver_dispatch = (num_receivers > 0)
            .then(|| limits.dispatch_for(num_receivers, &workgroup_size))
            .transpose()?;
        let pml_dispatches = |corrections: &[PmlCorrectionRef]| {
            corrections
                .iter()
                .filter(|correction| correction.work > 0)
                .map(|correction| {
                    Ok(PmlDispatch {
                        offset: (correction.params as u64 * pml_stride) as u32,
                        num_workgroups: limits.dispatch_for(correction.work, &workgroup_size)?,
                    })
                })
                .collect::<Result<Vec<_>, Error>>()
        };
        let electric_pml = pml_dispatches(&pml.electric)?;
        let magnetic_pml = pml_dispatches(&pml.magnetic)?;

        tracing::debug!(
            ?node_dispatch,
            num_pml_corrections = electric_pml.len() + magnetic_pml.len(),
            num_sources = sources.sources.len(),
            num_receivers,
            "created wgpu solver instance"
        );

        let kernels = Kernels {
            grid_bind_group,
            update_bind_group,
            sources_bind_group,
            pml_bind_group,
            update_magnetic,
            update_electric,
            update_electric_dispersive,
            update_magnetic_sources,
            update_electric_sources,
            store_outputs,
            update_pml,
            node_dispatch,
            receiver_dispatch,
            electric_pml,
            magnetic_pml,
            num_electric_sources: sources.num_electric,
            num_magnetic_sources: sources.num_magnetic,
            _modules: vec![update_module, sources_module, pml_module],
        };

        Ok(Self {
            backend,
            grid,
            buffers: Buffers {
                params: params_buffer,
                fields: fields_buffer,
                receiver_samples: receiver_samples_buffer,
            },
            kernels,
            params,
            encoder: None,
        })
    }

    fn take_encoder(&mut self) -> wgpu::CommandEncoder {
        self.encoder.take().unwrap_or_else(|| {
            self.backend
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("gpr-fdtd/iteration"),
                })
        })
    }

    /// Records one compute pass with the grid bind group set.
    fn pass(&mut self, label: &str, f: impl FnOnce(&mut wgpu::ComputePass, &Kernels)) {
        let encoder = self.encoder.get_or_insert_with(|| {
            self.backend
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("gpr-fdtd/iteration"),
                })
        });

        let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        compute_pass.set_bind_group(0, &self.kernels.grid_bind_group, &[]);
        f(&mut compute_pass, &self.kernels);
    }

    fn submit(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            self.backend.queue.submit([encoder.finish()]);
        }
    }

    fn update_field(&mut self, label: &str, pipeline: fn(&Kernels) -> &wgpu::ComputePipeline) {
        self.pass(label, |compute_pass, kernels| {
            let num_workgroups = kernels.node_dispatch;
            compute_pass.set_bind_group(1, &kernels.update_bind_group, &[]);
            compute_pass.set_pipeline(pipeline(kernels));
            compute_pass.dispatch_workgroups(num_workgroups.x, num_workgroups.y, num_workgroups.z);
        });
    }

    fn update_pml(&mut self, label: &str, corrections: fn(&Kernels) -> &[PmlDispatch]) {
        if corrections(&self.kernels).is_empty() {
            return;
        }
        self.pass(label, |compute_pass, kernels| {
            compute_pass.set_pipeline(&kernels.update_pml);
            for correction in corrections(kernels) {
                let num_workgroups = correction.num_workgroups;
                compute_pass.set_bind_group(1, &kernels.pml_bind_group, &[correction.offset]);
                compute_pass.dispatch_workgroups(
                    num_workgroups.x,
                    num_workgroups.y,
                    num_workgroups.z,
                );
            }
        });
    }

    fn update_sources(&mut self, label: &str, pipeline: fn(&Kernels) -> &wgpu::ComputePipeline) {
        self.pass(label, |compute_pass, kernels| {
            compute_pass.set_bind_group(1, &kernels.sources_bind_group, &[]);
            compute_pass.set_pipeline(pipeline(kernels));
            compute_pass.dispatch_workgroups(1, 1, 1);
        });
    }

    /// Submits all pending work and copies the fields into the grid.
    fn read_fields(&mut self) -> Result<(), Error> {
        let encoder = self.take_encoder();
        let data = read_buffer::<f32>(
            &self.backend.device,
            &self.backend.queue,
            encoder,
            &self.buffers.fields,
            "gpr-fdtd/staging/fields",
        )?;

        let num_nodes = self.grid.num_nodes();
        let fields = self.grid.fields_mut();
        for (component, values) in <FieldComponent as strum::VariantArray>::VARIANTS
            .iter()
            .zip(data.chunks_exact(num_nodes))
        {
            fields
                .component_mut(*component)
                .as_mut_slice()
                .copy_from_slice(values);
        }

        Ok(())
    }

    fn read_receivers(&mut self) -> Result<(), Error> {
        let iterations = self.grid.iterations;
        if self.grid.receivers.is_empty() || iterations == 0 {
            return Ok(());
        }

        let encoder = self.take_encoder();
        let samples = read_buffer::<[f32; 6]>(
            &self.backend.device,
            &self.backend.queue,
            encoder,
            &self.buffers.receiver_samples,
            "gpr-fdtd/staging/receiver_samples",
        )?;

        for (receiver, samples) in self
            .grid
            .receivers
            .iter_mut()
            .zip(samples.chunks_exact(iterations))
        {
            receiver.samples.copy_from_slice(samples);
        }

        Ok(())
    }
}

impl<'a> LeapfrogStep for WgpuSolverInstance<'a> {
    fn store_outputs(&mut self, iteration: usize) {
        // the previous iteration was recorded against the previous counter
        self.submit();
        self.params.iteration = iteration as u32;
        self.backend
            .queue
            .write_buffer(&self.buffers.params, 0, bytemuck::bytes_of(&self.params));

        if self.kernels.receiver_dispatch.is_some() {
            self.pass("store_outputs", |compute_pass, kernels| {
                if let Some(num_workgroups) = kernels.receiver_dispatch {
                    compute_pass.set_bind_group(1, &kernels.sources_bind_group, &[]);
                    compute_pass.set_pipeline(&kernels.store_outputs);
                    compute_pass.dispatch_workgroups(
                        num_workgroups.x,
                        num_workgroups.y,
                        num_workgroups.z,
                    );
                }
            });
        }
    }

    fn update_magnetic(&mut self) {
        self.update_field("update_magnetic", |kernels| &kernels.update_magnetic);
    }

    fn update_magnetic_pml(&mut self) {
        self.update_pml("update_magnetic_pml", |kernels| &kernels.magnetic_pml[..]);
    }

    fn update_magnetic_sources(&mut self, _iteration: usize) {
        if self.kernels.num_magnetic_sources > 0 {
            self.update_sources("update_magnetic_sources", |kernels| {
                &kernels.update_magnetic_sources
            });
        }
    }

    fn update_electric(&mut self) {
        if self.kernels.update_electric_dispersive.is_some() {
            self.update_field("update_electric_dispersive_a", |kernels| {
                match &kernels.update_electric_dispersive {
                    Some((phase_a, _)) => phase_a,
                    None => &kernels.update_electric,
                }
            });
        }
        else {
            self.update_field("update_electric", |kernels| &kernels.update_electric);
        }
    }

    fn update_electric_pml(&mut self) {
        self.update_pml("update_electric_pml", |kernels| &kernels.electric_pml[..]);
    }

    fn update_electric_sources(&mut self, _iteration: usize) {
        if self.kernels.num_electric_sources > 0 {
            self.update_sources("update_electric_sources", |kernels| {
                &kernels.update_electric_sources
            });
        }
    }

    fn update_electric_dispersive(&mut self) {
        if self.kernels.update_electric_dispersive.is_some() {
            self.update_field("update_electric_dispersive_b", |kernels| {
                match &kernels.update_electric_dispersive {
                    Some((_, phase_b)) => phase_b,
                    None => &kernels.update_electric,
                }
            });
        }
    }

    fn with_fields(&mut self, f: &mut dyn FnMut(&FieldArrays)) -> Result<(), Error> {
        self.read_fields()?;
        f(self.grid.fields());
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Error> {
        self.read_fields()?;
        self.read_receivers()?;
        tracing::debug!("copied results from device");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::Point3;

    use super::WgpuBackend;
    use crate::{
        Real,
        grid::{
            Grid,
            geometry::GeometryCommand,
        },
        material::{
            Material,
            Pole,
        },
        model::tests::prepared_grid,
        pml::PmlThickness,
        solver::{
            SolverBackend,
            cpu::{
                CpuBackend,
                tests::{
                    dipole_model,
                    run_to_end,
                },
            },
        },
    };

    fn backend() -> Option<WgpuBackend> {
        match WgpuBackend::request(u64::MAX) {
            Ok(backend) => Some(backend),
            Err(error) => {
                eprintln!("skipping gpu test: {error}");
                None
            }
        }
    }

    fn max_abs(values: impl IntoIterator<Item = Real>) -> Real {
        values.into_iter().fold(0.0, |max, value| max.max(value.abs()))
    }

    fn assert_receivers_match(gpu: &Grid, cpu: &Grid) {
        for (gpu, cpu) in gpu.receivers().iter().zip(cpu.receivers()) {
            let peak = max_abs(cpu.samples.iter().flatten().copied());
            assert!(peak > 0.0);
            let difference = max_abs(
                gpu.samples
                    .iter()
                    .flatten()
                    .zip(cpu.samples.iter().flatten())
                    .map(|(gpu, cpu)| gpu - cpu),
            );
            assert!(
                difference <= 1e-5 * peak,
                "receiver {}: difference {difference} with peak {peak}",
                cpu.id
            );
        }
    }

    #[test]
    fn gpu_matches_cpu() {
        let Some(backend) = backend()
        else {
            return;
        };

        let description = dipole_model(16, 60);
        let mut cpu = prepared_grid(&description);
        let mut gpu = cpu.clone();

        run_to_end(&CpuBackend::single_threaded(), &mut cpu);
        run_to_end(&backend, &mut gpu);

        assert_receivers_match(&gpu, &cpu);
        let peak = max_abs(cpu.fields().ez.as_slice().iter().copied());
        let difference = max_abs(
            gpu.fields()
                .ez
                .as_slice()
                .iter()
                .zip(cpu.fields().ez.as_slice())
                .map(|(gpu, cpu)| gpu - cpu),
        );
        assert!(difference <= 1e-5 * peak);
    }

    #[test]
    fn gpu_matches_cpu_with_pml_and_dispersion() {
        let Some(backend) = backend()
        else {
            return;
        };

        let mut description = dipole_model(20, 60);
        description.pml.thickness = PmlThickness::uniform(4);
        description.materials.push(Material {
            relative_permittivity: 4.0,
            poles: vec![
                Pole::Debye {
                    delta_er: 6.0,
                    tau: 1e-11,
                };
                2
            ],
            ..Material::new("wet_soil")
        });
        description.geometry.push(GeometryCommand::Box {
            lower: Point3::new(0.0, 0.0, 0.0),
            upper: Point3::new(0.02, 0.02, 0.008),
            material: "wet_soil".to_owned(),
            averaging: false,
        });

        let mut cpu = prepared_grid(&description);
        let mut gpu = cpu.clone();
        run_to_end(&CpuBackend::single_threaded(), &mut cpu);
        run_to_end(&backend, &mut gpu);

        assert_receivers_match(&gpu, &cpu);
    }

    #[test]
    fn kernels_are_shared_between_instances() {
        let Some(backend) = backend()
        else {
            return;
        };

        let description = dipole_model(8, 4);
        let mut first = prepared_grid(&description);
        let mut second = first.clone();
        {
            let _a = backend.create_instance(&mut first).unwrap();
            let _b = backend.create_instance(&mut second).unwrap();
            assert_eq!(backend.num_cached_kernels(), 3);
        }
        assert_eq!(backend.num_cached_kernels(), 0);
    }
}

use std::sync::Arc;

use bytemuck::Pod;
use nalgebra::Vector3;
use parking_lot::Mutex;

use crate::error::Error;

#[derive(Clone, Copy, Debug)]
pub struct ComputeLimits {
    pub max_invocations_per_workgroup: u32,
    pub max_workgroup_size: Vector3<u32>,

    /// Max number of workgroups per dispatch.
    ///
    /// This is one value for each dimension in wgpu, but for more flexibility
    /// we make it a vector.
    pub max_workgroups_per_dispatch: Vector3<u32>,

    pub min_uniform_buffer_offset_alignment: u32,
}

impl ComputeLimits {
    pub fn from_limits(limits: &wgpu::Limits) -> Self {
        Self {
            max_invocations_per_workgroup: limits.max_compute_invocations_per_workgroup,
            max_workgroup_size: Vector3::new(
                limits.max_compute_workgroup_size_x,
                limits.max_compute_workgroup_size_y,
                limits.max_compute_workgroup_size_z,
            ),
            max_workgroups_per_dispatch: Vector3::repeat(
                limits.max_compute_workgroups_per_dimension,
            ),
            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
        }
    }

    pub fn work_group_size_for(&self, work_size: usize) -> Vector3<u32> {
        work_group_size_for(
            work_size,
            &self.max_workgroup_size,
            self.max_invocations_per_workgroup,
        )
    }

    pub fn dispatch_for(
        &self,
        work_size: usize,
        workgroup_size: &Vector3<u32>,
    ) -> Result<Vector3<u32>, Error> {
        dispatch_for(work_size, workgroup_size, &self.max_workgroups_per_dispatch)
    }

    /// Stride between consecutive structs of `size` bytes in a uniform buffer
    /// bound with a dynamic offset.
    pub fn uniform_stride(&self, size: usize) -> u64 {
        let alignment = u64::from(self.min_uniform_buffer_offset_alignment.max(1));
        (size as u64).div_ceil(alignment) * alignment
    }
}

pub fn work_group_size_for(
    work_size: usize,
    max_workgroup_size: &Vector3<u32>,
    max_invocations_per_workgroup: u32,
) -> Vector3<u32> {
    let max_workgroup_size = max_workgroup_size.cast::<usize>();
    let mut n = work_size.min(max_invocations_per_workgroup as usize);
    let mut workgroup_size = Vector3::zeros();

    workgroup_size.x = n.clamp(1, max_workgroup_size.x);
    n /= workgroup_size.x;

    workgroup_size.y = n.clamp(1, max_workgroup_size.y);
    n /= workgroup_size.y;

    workgroup_size.z = n.clamp(1, max_workgroup_size.z);

    workgroup_size.cast()
}

/// Number of workgroups of one dispatch covering `work_size` invocations.
///
/// The kernels linearize the invocation ID and skip everything past the end
/// of the work, so this may cover more than `work_size`.
pub fn dispatch_for(
    work_size: usize,
    workgroup_size: &Vector3<u32>,
    max_workgroups_per_dispatch: &Vector3<u32>,
) -> Result<Vector3<u32>, Error> {
    let max = max_workgroups_per_dispatch.cast::<usize>();
    let mut remaining = work_size.div_ceil(workgroup_size.cast::<usize>().product());
    let mut num_workgroups = Vector3::<usize>::repeat(1);

    // put as much work as possible into x, then y, then z
    for axis in 0..3 {
        num_workgroups[axis] = remaining.clamp(1, max[axis]);
        remaining = remaining.div_ceil(num_workgroups[axis]);
    }

    if remaining > 1 {
        return Err(Error::Device(format!(
            "{work_size} invocations don't fit into a single dispatch"
        )));
    }

    Ok(num_workgroups.cast())
}

#[derive(Clone, Debug, Default)]
pub struct AsyncResultBuf {
    buf: Arc<Mutex<Option<Result<(), wgpu::BufferAsyncError>>>>,
}

impl AsyncResultBuf {
    pub fn callback(&self) -> impl FnOnce(Result<(), wgpu::BufferAsyncError>) + 'static {
        let buf = self.buf.clone();
        move |result| {
            let mut buf = buf.lock();
            *buf = Some(result);
        }
    }

    pub fn take(&self) -> Result<(), Error> {
        match self.buf.lock().take() {
            Some(result) => result.map_err(|error| Error::Device(error.to_string())),
            None => Err(Error::Device("buffer mapping hasn't finished".to_owned())),
        }
    }
}

/// Copies `buffer` into a staging buffer, waits for the copy and all prior
/// submissions, and returns the contents.
///
/// `encoder` may contain pending work, which is submitted together with the
/// copy.
pub fn read_buffer<T>(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    mut encoder: wgpu::CommandEncoder,
    buffer: &wgpu::Buffer,
    label: &str,
) -> Result<Vec<T>, Error>
where
    T: Pod,
{
    let size = buffer.size();
    let staging_buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    encoder.copy_buffer_to_buffer(buffer, 0, &staging_buffer, 0, size);

    let result_buf = AsyncResultBuf::default();
    encoder.map_buffer_on_submit(
        &staging_buffer,
        wgpu::MapMode::Read,
        ..,
        result_buf.callback(),
    );

    let submission_index = queue.submit([encoder.finish()]);
    device
        .poll(wgpu::PollType::Wait {
            submission_index: Some(submission_index),
            timeout: None,
        })
        .map_err(|error| Error::Device(error.to_string()))?;
    result_buf.take()?;

    let data = {
        let view = staging_buffer.get_mapped_range(..);
        bytemuck::pod_collect_to_vec::<u8, T>(&view)
    };
    staging_buffer.unmap();

    Ok(data)
}

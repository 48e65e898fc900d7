//! Memory admission check.
//!
//! Runs before the dispersive accumulators are allocated, so a model that
//! doesn't fit is rejected before any large allocation happens.

use std::fmt::Display;

use crate::{
    Complex,
    Real,
    coefficients::{
        NUM_COLUMNS,
        UpdateCoefficients,
    },
    error::Error,
    grid::{
        Grid,
        geometry::{
            RigidE,
            RigidH,
        },
    },
    material::MaterialId,
    util::format_size,
};

/// Fixed overhead of a model run.
pub const BASE_OVERHEAD: u64 = 50_000_000;

/// Bytes per material in the GPU coefficient uniform: one electric and one
/// magnetic row of two `vec4<f32>` each.
pub const CONSTANT_BYTES_PER_MATERIAL: u64 = 2 * 2 * 4 * size_of::<f32>() as u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostInfo {
    pub total_memory: u64,
}

impl HostInfo {
    pub fn new(total_memory: u64) -> Self {
        Self { total_memory }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: usize,
    pub name: String,
    pub total_memory: u64,
    /// Maximum size of the uniform buffer holding the coefficient tables.
    pub constant_memory: u64,
}

impl DeviceInfo {
    /// wgpu doesn't report the device's total memory, so it has to be given.
    #[cfg(feature = "wgpu")]
    pub fn from_wgpu(id: usize, adapter: &wgpu::Adapter, total_memory: u64) -> Self {
        let info = adapter.get_info();
        Self {
            id,
            name: info.name,
            total_memory,
            constant_memory: adapter.limits().max_uniform_buffer_binding_size.into(),
        }
    }
}

/// Estimated footprint of all standing arrays of a grid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryEstimate {
    pub base: u64,
    pub fields: u64,
    pub geometry: u64,
    pub coefficients: u64,
    pub pml: u64,
    pub dispersive: u64,
}

impl MemoryEstimate {
    pub fn for_grid(grid: &Grid) -> Self {
        let nodes = grid.num_nodes() as u64;
        let cells = grid.cells().product() as u64;
        let num_materials = grid.materials().len() as u64;
        let max_poles = grid.materials().max_poles() as u64;

        let real = size_of::<Real>() as u64;
        let complex = size_of::<Complex>() as u64;
        let per_cell = (size_of::<MaterialId>() + size_of::<RigidE>() + size_of::<RigidH>()) as u64;

        Self {
            base: BASE_OVERHEAD,
            fields: 6 * nodes * real,
            geometry: nodes * size_of::<[MaterialId; 6]>() as u64 + cells * per_cell,
            coefficients: 2 * num_materials * NUM_COLUMNS as u64 * real
                + num_materials * 3 * max_poles * complex,
            pml: grid
                .pmls()
                .iter()
                .map(|pml| pml.size_in_bytes() as u64)
                .sum(),
            dispersive: 3 * max_poles * nodes * complex,
        }
    }

    pub fn total(&self) -> u64 {
        self.base + self.fields + self.geometry + self.coefficients + self.pml + self.dispersive
    }
}

impl Display for MemoryEstimate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "~{}", format_size(self.total()))?;
        if self.dispersive > 0 {
            write!(f, " ({} for dispersive materials)", format_size(self.dispersive))?;
        }
        Ok(())
    }
}

/// Fails if the estimate exceeds host memory, or the memory of the selected
/// device.
pub fn admit(
    estimate: &MemoryEstimate,
    host: &HostInfo,
    device: Option<&DeviceInfo>,
) -> Result<(), Error> {
    let estimated = estimate.total();

    if estimated > host.total_memory {
        return Err(Error::InsufficientHostMemory {
            estimated,
            available: host.total_memory,
        });
    }

    if let Some(device) = device
        && estimated > device.total_memory
    {
        return Err(Error::InsufficientDeviceMemory {
            estimated,
            available: device.total_memory,
            device_id: device.id,
            device_name: device.name.clone(),
        });
    }

    Ok(())
}

/// Size of the coefficient uniform for `num_materials` materials.
pub fn constant_memory_required(num_materials: usize) -> u64 {
    num_materials as u64 * CONSTANT_BYTES_PER_MATERIAL
}

/// Fails if the coefficient tables don't fit into one uniform buffer binding
/// of the device.
pub fn check_constant_memory(
    coefficients: &UpdateCoefficients,
    device: &DeviceInfo,
) -> Result<(), Error> {
    let num_materials = coefficients.num_materials();
    let required = constant_memory_required(num_materials);
    if required > device.constant_memory {
        return Err(Error::CoefficientTableTooLarge {
            num_materials,
            required,
            available: device.constant_memory,
            device_id: device.id,
            device_name: device.name.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        BASE_OVERHEAD,
        DeviceInfo,
        HostInfo,
        MemoryEstimate,
        admit,
        check_constant_memory,
    };
    use crate::{
        error::Error,
        grid::{
            Grid,
            tests::empty_model,
        },
        material::{
            Material,
            PhysicalConstants,
            Pole,
        },
    };

    fn dispersive_grid() -> Grid {
        let mut description = empty_model([20, 20, 20], 10);
        description.materials.push(Material {
            relative_permittivity: 4.0,
            poles: vec![
                Pole::Debye {
                    delta_er: 10.0,
                    tau: 1e-9,
                };
                3
            ],
            ..Material::new("wet_soil")
        });
        Grid::new(&description, PhysicalConstants::SI).unwrap()
    }

    fn device(total_memory: u64, constant_memory: u64) -> DeviceInfo {
        DeviceInfo {
            id: 0,
            name: "test device".to_owned(),
            total_memory,
            constant_memory,
        }
    }

    #[test]
    fn estimate_counts_dispersive_state() {
        let grid = dispersive_grid();
        let estimate = MemoryEstimate::for_grid(&grid);
        assert_eq!(estimate.base, BASE_OVERHEAD);
        assert_eq!(estimate.fields, 6 * 21 * 21 * 21 * 4);
        assert_eq!(estimate.dispersive, 3 * 3 * 21 * 21 * 21 * 8);
        assert!(estimate.total() > BASE_OVERHEAD);
        assert!(estimate.to_string().contains("dispersive"));
    }

    #[test]
    fn admission_fails_before_dispersive_allocation() {
        let mut grid = dispersive_grid();
        let error = grid
            .prepare(&HostInfo::new(BASE_OVERHEAD), None)
            .unwrap_err();
        assert!(matches!(error, Error::InsufficientHostMemory { .. }));
        assert!(grid.dispersive_state().is_none());
        assert!(grid.coefficients().is_none());

        let error = grid
            .prepare(&HostInfo::new(u64::MAX), Some(&device(1024, 65536)))
            .unwrap_err();
        assert!(matches!(
            error,
            Error::InsufficientDeviceMemory { device_id: 0, .. }
        ));
        assert!(grid.dispersive_state().is_none());

        grid.prepare(&HostInfo::new(u64::MAX), None).unwrap();
        let dispersive = grid.dispersive_state().unwrap();
        assert_eq!(dispersive.poles, 3);
        assert_eq!(dispersive.tx.len(), 3 * 21 * 21 * 21);
    }

    #[test]
    fn admission_message_carries_sizes() {
        let estimate = MemoryEstimate {
            base: 2 * 1024 * 1024,
            ..Default::default()
        };
        let error = admit(&estimate, &HostInfo::new(1024 * 1024), None).unwrap_err();
        let message = error.to_string();
        assert!(message.contains("2 MiB"), "{message}");
        assert!(message.contains("1 MiB"), "{message}");
    }

    #[test]
    fn too_many_materials_for_constant_memory() {
        let mut grid = dispersive_grid();
        grid.prepare(&HostInfo::new(u64::MAX), None).unwrap();
        let coefficients = grid.coefficients().unwrap();
        // 3 materials, 64 bytes each
        assert!(check_constant_memory(coefficients, &device(u64::MAX, 192)).is_ok());
        assert!(matches!(
            check_constant_memory(coefficients, &device(u64::MAX, 191)),
            Err(Error::CoefficientTableTooLarge {
                num_materials: 3,
                ..
            })
        ));
    }
}

//! Derives edge IDs from the painted solid array.

use nalgebra::Point3;
use smallvec::SmallVec;

use crate::{
    grid::{
        Axis,
        FieldComponent,
        Grid,
        Mode,
        geometry::EDGE_CORNERS,
    },
    lattice::iter_points,
    material::{
        MaterialId,
        Materials,
    },
};

impl Grid {
    /// Assigns every non-rigid electric edge inside its update range the
    /// material of the 4 cells around it, or their average.
    pub fn build_electric_components(&mut self) {
        for axis in [Axis::X, Axis::Y, Axis::Z] {
            let component = FieldComponent::electric(axis);
            let [b, c] = axis.transverse().map(|axis| axis.index());

            for node in iter_points(component.update_range(&self.cells), self.nodes()) {
                if self.is_rigid_edge(axis, &node) {
                    continue;
                }

                let around = EDGE_CORNERS
                    .iter()
                    .map(|[db, dc]| {
                        let mut cell = node;
                        cell[b] -= db;
                        cell[c] -= dc;
                        self.solid[cell]
                    })
                    .collect::<SmallVec<[MaterialId; 4]>>();

                self.ids[node][component.index()] = self.material_around(&around);
            }
        }
    }

    /// Like [`Self::build_electric_components`], with the 2 cells sharing
    /// each face.
    pub fn build_magnetic_components(&mut self) {
        for axis in [Axis::X, Axis::Y, Axis::Z] {
            let component = FieldComponent::magnetic(axis);

            for node in iter_points(component.update_range(&self.cells), self.nodes()) {
                if self.is_rigid_face(axis, &node) {
                    continue;
                }

                let mut below = node;
                below[axis.index()] -= 1;
                let around: SmallVec<[MaterialId; 4]> =
                    SmallVec::from_slice(&[self.solid[node], self.solid[below]]);

                self.ids[node][component.index()] = self.material_around(&around);
            }
        }
    }

    /// Pins the components that lie in the invariant direction of a 2D model
    /// to PEC.
    pub fn pin_invariant_components(&mut self) {
        let Some(invariant) = self.mode.invariant_axis()
        else {
            return;
        };

        let a = invariant.index();
        let nodes = self.nodes();
        for side in 0..2 {
            let mut start = Point3::origin();
            let mut end = Point3::from(nodes);
            start[a] = side;
            end[a] = side + 1;

            for node in iter_points(start..end, nodes) {
                for axis in invariant.transverse() {
                    self.ids[node][FieldComponent::electric(axis).index()] = Materials::PEC;
                }
            }
        }

        tracing::debug!(mode = ?self.mode, "pinned invariant components to pec");
    }

    /// Runs the builder passes in order.
    pub fn build_components(&mut self) {
        self.build_electric_components();
        self.build_magnetic_components();
        if self.mode != Mode::ThreeD {
            self.pin_invariant_components();
        }
        tracing::debug!(
            num_materials = self.materials.len(),
            "built edge ids"
        );
    }

    fn material_around(&mut self, around: &[MaterialId]) -> MaterialId {
        let first = around[0];
        if around.iter().all(|id| *id == first) {
            first
        }
        else {
            self.materials.average(around)
        }
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::Point3;

    use crate::{
        grid::{
            FieldComponent,
            Grid,
            geometry::GeometryCommand,
            tests::empty_model,
        },
        material::{
            Material,
            Materials,
            PhysicalConstants,
        },
    };

    #[test]
    fn free_space_stays_free_space() {
        let mut grid = Grid::new(&empty_model([5, 5, 5], 1), PhysicalConstants::SI).unwrap();
        grid.build_components();
        assert!(
            grid.ids()
                .as_slice()
                .iter()
                .all(|ids| *ids == [Materials::FREE_SPACE; 6])
        );
        assert_eq!(grid.materials().len(), 2);
    }

    #[test]
    fn boundary_of_averaged_box_gets_averaged_material() {
        let mut description = empty_model([6, 6, 6], 1);
        description.materials.push(Material {
            relative_permittivity: 5.0,
            ..Material::new("sand")
        });
        let mut grid = Grid::new(&description, PhysicalConstants::SI).unwrap();
        grid.paint(&GeometryCommand::Box {
            lower: Point3::new(0.0, 0.0, 0.0),
            upper: Point3::new(0.006, 0.006, 0.003),
            material: "sand".to_owned(),
            averaging: true,
        })
        .unwrap();
        grid.build_components();

        let sand = grid.materials().find("sand").unwrap();
        // inside the half-space
        assert_eq!(grid.id(FieldComponent::Ex, &Point3::new(2, 2, 2)), Some(sand));
        // on the interface two of four cells are sand
        let interface = grid.id(FieldComponent::Ex, &Point3::new(2, 2, 3)).unwrap();
        let averaged = grid.materials().get(interface);
        assert_eq!(averaged.name, "free_space+free_space+sand+sand");
        assert!((averaged.relative_permittivity - 3.0).abs() < 1e-12);
        // hz is normal to the interface and sees sand below and free space above
        let hz = grid.id(FieldComponent::Hz, &Point3::new(2, 2, 3)).unwrap();
        assert_eq!(grid.materials().get(hz).name, "free_space+sand");
        // above the interface
        assert_eq!(grid.id(FieldComponent::Ey, &Point3::new(2, 2, 5)), Some(Materials::FREE_SPACE));
    }

    #[test]
    fn rigid_edges_are_not_averaged() {
        let mut grid = Grid::new(&empty_model([6, 6, 6], 1), PhysicalConstants::SI).unwrap();
        grid.paint(&GeometryCommand::Box {
            lower: Point3::new(0.002, 0.002, 0.002),
            upper: Point3::new(0.004, 0.004, 0.004),
            material: "pec".to_owned(),
            averaging: false,
        })
        .unwrap();
        grid.build_components();
        assert_eq!(grid.id(FieldComponent::Ez, &Point3::new(2, 2, 3)), Some(Materials::PEC));
        assert_eq!(grid.id(FieldComponent::Hx, &Point3::new(2, 3, 3)), Some(Materials::PEC));
        assert_eq!(grid.materials().len(), 2);
    }

    #[test]
    fn two_d_pins_invariant_components() {
        let mut grid = Grid::new(&empty_model([10, 10, 1], 1), PhysicalConstants::SI).unwrap();
        grid.build_components();
        for k in 0..2 {
            let node = Point3::new(4, 5, k);
            assert_eq!(grid.id(FieldComponent::Ex, &node), Some(Materials::PEC));
            assert_eq!(grid.id(FieldComponent::Ey, &node), Some(Materials::PEC));
            assert_eq!(grid.id(FieldComponent::Ez, &node), Some(Materials::FREE_SPACE));
        }
    }
}

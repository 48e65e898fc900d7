//! Geometry primitives and the per-cell rigid flags.
//!
//! Primitives paint the solid array (material per cell) in the order they are
//! given. Primitives that don't average also write the edge IDs of the cells
//! they cover directly and mark those edges rigid, so the builder leaves them
//! alone.

use bitflags::bitflags;
use nalgebra::{
    Point3,
    Vector3,
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    error::Error,
    grid::{
        Axis,
        FieldComponent,
        Grid,
    },
    lattice::iter_points,
    material::MaterialId,
};

bitflags! {
    /// The 12 electric edges of a cell.
    ///
    /// Bits `4*axis + corner` with the corner in the plane transverse to the
    /// edge, counting `(0,0), (1,0), (1,1), (0,1)`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct RigidE: u16 {
        const EX0 = 1 << 0;
        const EX1 = 1 << 1;
        const EX2 = 1 << 2;
        const EX3 = 1 << 3;
        const EY0 = 1 << 4;
        const EY1 = 1 << 5;
        const EY2 = 1 << 6;
        const EY3 = 1 << 7;
        const EZ0 = 1 << 8;
        const EZ1 = 1 << 9;
        const EZ2 = 1 << 10;
        const EZ3 = 1 << 11;
    }
}

bitflags! {
    /// The 6 magnetic faces of a cell. Bits `2*axis + side`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct RigidH: u8 {
        const HX0 = 1 << 0;
        const HX1 = 1 << 1;
        const HY0 = 1 << 2;
        const HY1 = 1 << 3;
        const HZ0 = 1 << 4;
        const HZ1 = 1 << 5;
    }
}

/// Offsets of the 4 edges along one axis in a cell, in the transverse plane.
pub const EDGE_CORNERS: [[usize; 2]; 4] = [[0, 0], [1, 0], [1, 1], [0, 1]];

impl RigidE {
    pub fn edge(axis: Axis, corner: usize) -> Self {
        Self::from_bits_retain(1 << (4 * axis.index() + corner))
    }
}

impl RigidH {
    pub fn face(axis: Axis, side: usize) -> Self {
        Self::from_bits_retain(1 << (2 * axis.index() + side))
    }
}

/// Geometry command as given in the model description. All coordinates are in
/// metres.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GeometryCommand {
    Box {
        lower: Point3<f64>,
        upper: Point3<f64>,
        material: String,
        #[serde(default = "default_averaging")]
        averaging: bool,
    },
    Sphere {
        center: Point3<f64>,
        radius: f64,
        material: String,
        #[serde(default = "default_averaging")]
        averaging: bool,
    },
    Cylinder {
        start: Point3<f64>,
        end: Point3<f64>,
        radius: f64,
        material: String,
        #[serde(default = "default_averaging")]
        averaging: bool,
    },
    /// Zero-thickness rectangle. `lower` and `upper` must agree on exactly one
    /// axis.
    Plate {
        lower: Point3<f64>,
        upper: Point3<f64>,
        material: String,
    },
    /// Line of edges. `start` and `end` must differ on exactly one axis.
    Edge {
        start: Point3<f64>,
        end: Point3<f64>,
        material: String,
    },
}

fn default_averaging() -> bool {
    true
}

/// Cells that have the edge along `axis` at `node` as one of their 12 edges,
/// together with the flag of that edge in each cell.
pub fn cells_sharing_edge(
    cells: &Vector3<usize>,
    axis: Axis,
    node: &Point3<usize>,
) -> impl Iterator<Item = (Point3<usize>, RigidE)> {
    let [b, c] = axis.transverse().map(|axis| axis.index());
    let node = *node;
    let inside = node[axis.index()] < cells[axis.index()];
    EDGE_CORNERS
        .iter()
        .enumerate()
        .filter_map(move |(corner, [db, dc])| {
            if !inside || node[b] < *db || node[c] < *dc {
                return None;
            }
            let mut cell = node;
            cell[b] -= db;
            cell[c] -= dc;
            (cell[b] < cells[b] && cell[c] < cells[c]).then(|| (cell, RigidE::edge(axis, corner)))
        })
}

/// Cells that have the face normal to `axis` at `node` as one of their 6
/// faces.
pub fn cells_sharing_face(
    cells: &Vector3<usize>,
    axis: Axis,
    node: &Point3<usize>,
) -> impl Iterator<Item = (Point3<usize>, RigidH)> {
    let a = axis.index();
    let node = *node;
    let inside = axis
        .transverse()
        .iter()
        .all(|other| node[other.index()] < cells[other.index()]);
    (0..2).filter_map(move |side| {
        if !inside || node[a] < side {
            return None;
        }
        let mut cell = node;
        cell[a] -= side;
        (cell[a] < cells[a]).then(|| (cell, RigidH::face(axis, side)))
    })
}

impl Grid {
    /// Paints all geometry commands in order.
    pub fn paint_geometry(&mut self, commands: &[GeometryCommand]) -> Result<(), Error> {
        for command in commands {
            self.paint(command)?;
        }
        Ok(())
    }

    pub fn paint(&mut self, command: &GeometryCommand) -> Result<(), Error> {
        tracing::trace!(?command, "painting");

        match command {
            GeometryCommand::Box {
                lower,
                upper,
                material,
                averaging,
            } => {
                let material = self.materials.find(material)?;
                let averaging = self.averages(material, *averaging);
                let lower = self.to_cells(lower, "box")?;
                let upper = self.to_cells(upper, "box")?;
                for cell in iter_points(lower..upper, self.cells) {
                    self.paint_voxel(&cell, material, averaging);
                }
            }
            GeometryCommand::Sphere {
                center,
                radius,
                material,
                averaging,
            } => {
                let material = self.materials.find(material)?;
                let averaging = self.averages(material, *averaging);
                let extent = Vector3::repeat(*radius);
                let (lower, upper) = self.bounding_cells(&(center - extent), &(center + extent));
                for cell in iter_points(lower..upper, self.cells) {
                    if (self.cell_center(&cell) - center).norm() <= *radius {
                        self.paint_voxel(&cell, material, averaging);
                    }
                }
            }
            GeometryCommand::Cylinder {
                start,
                end,
                radius,
                material,
                averaging,
            } => {
                let material = self.materials.find(material)?;
                let averaging = self.averages(material, *averaging);
                let extent = Vector3::repeat(*radius);
                let (lower, upper) = self.bounding_cells(
                    &(start.coords.inf(&end.coords) - extent).into(),
                    &(start.coords.sup(&end.coords) + extent).into(),
                );
                let axis = end - start;
                let length_squared = axis.norm_squared();
                if !(length_squared > 0.0) {
                    return Err(Error::InvalidConfig(
                        "cylinder must have a non-zero length".to_owned(),
                    ));
                }
                for cell in iter_points(lower..upper, self.cells) {
                    let relative = self.cell_center(&cell) - start;
                    let t = relative.dot(&axis) / length_squared;
                    if (0.0..=1.0).contains(&t) && (relative - t * axis).norm() <= *radius {
                        self.paint_voxel(&cell, material, averaging);
                    }
                }
            }
            GeometryCommand::Plate {
                lower,
                upper,
                material,
            } => {
                let material = self.materials.find(material)?;
                let lower = self.to_cells(lower, "plate")?;
                let upper = self.to_cells(upper, "plate")?;
                let normal = single_axis(&lower, &upper, |a, b| a == b).ok_or_else(|| {
                    Error::InvalidConfig(format!(
                        "plate from {lower} to {upper} must have zero thickness along exactly one axis"
                    ))
                })?;
                let [b, c] = normal.transverse();
                for cell in iter_points(lower..upper.map(|x| x + 1), self.cells.add_scalar(1)) {
                    if cell[b.index()] < upper[b.index()] && cell[c.index()] < upper[c.index()] {
                        for (axis, other) in [(b, c), (c, b)] {
                            self.set_rigid_edge(axis, &cell, material);
                            let mut next = cell;
                            next[other.index()] += 1;
                            self.set_rigid_edge(axis, &next, material);
                        }
                    }
                }
            }
            GeometryCommand::Edge {
                start,
                end,
                material,
            } => {
                let material = self.materials.find(material)?;
                let start = self.to_cells(start, "edge")?;
                let end = self.to_cells(end, "edge")?;
                let axis = single_axis(&start, &end, |a, b| a != b).ok_or_else(|| {
                    Error::InvalidConfig(format!(
                        "edge from {start} to {end} must extend along exactly one axis"
                    ))
                })?;
                let a = axis.index();
                let mut node = start.inf(&end);
                for n in start[a].min(end[a])..start[a].max(end[a]) {
                    node[a] = n;
                    self.set_rigid_edge(axis, &node, material);
                }
            }
        }

        Ok(())
    }

    /// Writes one cell.
    ///
    /// With averaging the cell's edges are derived later from its neighbours,
    /// otherwise they are written now and marked rigid.
    pub fn paint_voxel(&mut self, cell: &Point3<usize>, material: MaterialId, averaging: bool) {
        self.solid[*cell] = material;

        if averaging {
            self.rigid_e[*cell] = RigidE::empty();
            self.rigid_h[*cell] = RigidH::empty();
        }
        else {
            self.rigid_e[*cell] = RigidE::all();
            self.rigid_h[*cell] = RigidH::all();

            for axis in [Axis::X, Axis::Y, Axis::Z] {
                let [b, c] = axis.transverse().map(|axis| axis.index());
                let electric = FieldComponent::electric(axis).index();
                for [db, dc] in EDGE_CORNERS {
                    let mut node = *cell;
                    node[b] += db;
                    node[c] += dc;
                    self.ids[node][electric] = material;
                }

                let magnetic = FieldComponent::magnetic(axis).index();
                let mut node = *cell;
                self.ids[node][magnetic] = material;
                node[axis.index()] += 1;
                self.ids[node][magnetic] = material;
            }
        }
    }

    /// Whether any cell sharing the edge has marked it rigid.
    pub fn is_rigid_edge(&self, axis: Axis, node: &Point3<usize>) -> bool {
        cells_sharing_edge(&self.cells, axis, node).any(|(cell, flag)| self.rigid_e[cell].contains(flag))
    }

    pub fn is_rigid_face(&self, axis: Axis, node: &Point3<usize>) -> bool {
        cells_sharing_face(&self.cells, axis, node).any(|(cell, flag)| self.rigid_h[cell].contains(flag))
    }

    /// Marks an edge rigid in every cell sharing it and writes its ID.
    fn set_rigid_edge(&mut self, axis: Axis, node: &Point3<usize>, material: MaterialId) {
        for (cell, flag) in cells_sharing_edge(&self.cells, axis, node) {
            self.rigid_e[cell].insert(flag);
        }
        if let Some(ids) = self.ids.get_mut(node) {
            ids[FieldComponent::electric(axis).index()] = material;
        }
    }

    fn averages(&self, material: MaterialId, averaging: bool) -> bool {
        averaging && self.materials.is_averagable(material)
    }

    fn cell_center(&self, cell: &Point3<usize>) -> Point3<f64> {
        cell.map(|x| x as f64 + 0.5)
            .coords
            .component_mul(&self.spacing)
            .into()
    }

    /// Rounds a position in metres to a node, which must lie inside the
    /// domain.
    fn to_cells(&self, position: &Point3<f64>, what: &str) -> Result<Point3<usize>, Error> {
        let node = position.coords.component_div(&self.spacing).map(f64::round);
        if (0..3).any(|axis| node[axis] < 0.0 || node[axis] > self.cells[axis] as f64) {
            return Err(Error::InvalidConfig(format!(
                "{what} coordinate {position} lies outside the domain"
            )));
        }
        Ok(node.map(|x| x as usize).into())
    }

    /// Cell range covering a bounding box in metres, clamped to the domain.
    fn bounding_cells(
        &self,
        lower: &Point3<f64>,
        upper: &Point3<f64>,
    ) -> (Point3<usize>, Point3<usize>) {
        let clamp = |x: f64, n: usize| x.max(0.0).min(n as f64) as usize;
        let lower = lower.coords.component_div(&self.spacing);
        let upper = upper.coords.component_div(&self.spacing);
        (
            Point3::new(
                clamp(lower.x.floor(), self.cells.x),
                clamp(lower.y.floor(), self.cells.y),
                clamp(lower.z.floor(), self.cells.z),
            ),
            Point3::new(
                clamp(upper.x.ceil(), self.cells.x),
                clamp(upper.y.ceil(), self.cells.y),
                clamp(upper.z.ceil(), self.cells.z),
            ),
        )
    }
}

/// The only axis on which `predicate` holds.
fn single_axis(
    a: &Point3<usize>,
    b: &Point3<usize>,
    predicate: impl Fn(usize, usize) -> bool,
) -> Option<Axis> {
    let mut axes = (0..3).filter(|axis| predicate(a[*axis], b[*axis]));
    let axis = axes.next()?;
    axes.next().is_none().then(|| Axis::from_index(axis))
}

#[cfg(test)]
mod tests {
    use nalgebra::{
        Point3,
        Vector3,
    };

    use super::{
        GeometryCommand,
        RigidE,
        RigidH,
        cells_sharing_edge,
        cells_sharing_face,
    };
    use crate::{
        grid::{
            Axis,
            FieldComponent,
            Grid,
            tests::empty_model,
        },
        material::{
            Material,
            Materials,
            PhysicalConstants,
        },
    };

    fn grid_with_metal() -> Grid {
        let mut description = empty_model([10, 10, 10], 1);
        description.materials.push(Material {
            relative_permittivity: 6.0,
            ..Material::new("concrete")
        });
        Grid::new(&description, PhysicalConstants::SI).unwrap()
    }

    #[test]
    fn interior_edges_are_shared_by_four_cells() {
        let cells = Vector3::repeat(4);
        let shared = cells_sharing_edge(&cells, Axis::X, &Point3::new(1, 2, 2)).collect::<Vec<_>>();
        assert_eq!(shared.len(), 4);
        assert!(shared.contains(&(Point3::new(1, 2, 2), RigidE::EX0)));
        assert!(shared.contains(&(Point3::new(1, 1, 1), RigidE::EX2)));

        let corner = cells_sharing_edge(&cells, Axis::Z, &Point3::new(0, 0, 3)).collect::<Vec<_>>();
        assert_eq!(corner, vec![(Point3::new(0, 0, 3), RigidE::EZ0)]);

        // beyond the last cell along the edge direction
        assert_eq!(cells_sharing_edge(&cells, Axis::Z, &Point3::new(1, 1, 4)).count(), 0);
    }

    #[test]
    fn faces_are_shared_by_two_cells() {
        let cells = Vector3::repeat(4);
        let shared = cells_sharing_face(&cells, Axis::Y, &Point3::new(1, 2, 3)).collect::<Vec<_>>();
        assert_eq!(
            shared,
            vec![
                (Point3::new(1, 2, 3), RigidH::HY0),
                (Point3::new(1, 1, 3), RigidH::HY1)
            ]
        );
        assert_eq!(cells_sharing_face(&cells, Axis::Y, &Point3::new(1, 4, 3)).count(), 1);
    }

    #[test]
    fn non_averaged_box_writes_edges_and_rigid_flags() {
        let mut grid = grid_with_metal();
        grid.paint(&GeometryCommand::Box {
            lower: Point3::new(0.002, 0.002, 0.002),
            upper: Point3::new(0.004, 0.004, 0.004),
            material: "pec".to_owned(),
            averaging: true,
        })
        .unwrap();

        // pec is not averagable, so averaging is ignored
        assert_eq!(grid.solid[Point3::new(3, 3, 3)], Materials::PEC);
        assert_eq!(grid.rigid_e[Point3::new(3, 3, 3)], RigidE::all());
        assert_eq!(grid.id(FieldComponent::Ex, &Point3::new(3, 4, 4)), Some(Materials::PEC));
        assert_eq!(grid.id(FieldComponent::Ex, &Point3::new(4, 4, 4)), Some(Materials::FREE_SPACE));
        assert_eq!(grid.id(FieldComponent::Hz, &Point3::new(2, 2, 4)), Some(Materials::PEC));
        assert!(grid.is_rigid_edge(Axis::Y, &Point3::new(4, 3, 2)));
        assert!(!grid.is_rigid_edge(Axis::Y, &Point3::new(5, 3, 2)));
        assert!(grid.is_rigid_face(Axis::X, &Point3::new(4, 2, 2)));
    }

    #[test]
    fn averaged_sphere_only_paints_solid() {
        let mut grid = grid_with_metal();
        grid.paint(&GeometryCommand::Sphere {
            center: Point3::new(0.005, 0.005, 0.005),
            radius: 0.002,
            material: "concrete".to_owned(),
            averaging: true,
        })
        .unwrap();

        let concrete = grid.materials.find("concrete").unwrap();
        assert_eq!(grid.solid[Point3::new(4, 4, 4)], concrete);
        assert_eq!(grid.solid[Point3::new(0, 0, 0)], Materials::FREE_SPACE);
        assert_eq!(grid.rigid_e[Point3::new(4, 4, 4)], RigidE::empty());
        assert_eq!(grid.id(FieldComponent::Ex, &Point3::new(4, 4, 4)), Some(Materials::FREE_SPACE));
    }

    #[test]
    fn edges_and_plates_mark_only_their_edges() {
        let mut grid = grid_with_metal();
        grid.paint(&GeometryCommand::Edge {
            start: Point3::new(0.005, 0.002, 0.005),
            end: Point3::new(0.005, 0.006, 0.005),
            material: "pec".to_owned(),
        })
        .unwrap();
        for j in 2..6 {
            assert_eq!(grid.id(FieldComponent::Ey, &Point3::new(5, j, 5)), Some(Materials::PEC));
            assert!(grid.is_rigid_edge(Axis::Y, &Point3::new(5, j, 5)));
        }
        assert!(!grid.is_rigid_edge(Axis::Y, &Point3::new(5, 6, 5)));
        assert_eq!(grid.solid[Point3::new(5, 3, 5)], Materials::FREE_SPACE);

        grid.paint(&GeometryCommand::Plate {
            lower: Point3::new(0.001, 0.001, 0.003),
            upper: Point3::new(0.003, 0.002, 0.003),
            material: "pec".to_owned(),
        })
        .unwrap();
        assert_eq!(grid.id(FieldComponent::Ex, &Point3::new(2, 2, 3)), Some(Materials::PEC));
        assert_eq!(grid.id(FieldComponent::Ey, &Point3::new(3, 1, 3)), Some(Materials::PEC));
        assert_eq!(grid.id(FieldComponent::Ez, &Point3::new(2, 1, 3)), Some(Materials::FREE_SPACE));
        assert!(grid.is_rigid_edge(Axis::X, &Point3::new(1, 1, 3)));
        assert!(!grid.is_rigid_edge(Axis::X, &Point3::new(3, 1, 3)));

        assert!(
            grid.paint(&GeometryCommand::Plate {
                lower: Point3::new(0.001, 0.001, 0.003),
                upper: Point3::new(0.003, 0.002, 0.004),
                material: "pec".to_owned(),
            })
            .is_err()
        );
    }
}

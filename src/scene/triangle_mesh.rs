use arrayvec::ArrayVec;

use super::buffer::{BufferError, GeometryBuffer, MappedCounter};
use crate::geometry::{Triangle, TrianglePlane, WorldBox, WorldPoint};

/// Most vertex buffers a geometry can have, one per time step.
pub const MAX_TIME_STEPS: usize = 2;

/// Indexed triangles, optionally with a second vertex buffer for motion blur.
#[derive(Debug)]
pub struct TriangleMesh {
    indices: GeometryBuffer<Triangle<u32>>,
    vertices: ArrayVec<GeometryBuffer<WorldPoint>, MAX_TIME_STEPS>,
}

impl TriangleMesh {
    /// Mesh with buffers that have no storage yet, to be filled through `map` or `set`.
    /// Panics unless `time_steps` is 1 or 2.
    pub fn new(triangle_count: usize, vertex_count: usize, time_steps: usize) -> Self {
        assert!((1..=MAX_TIME_STEPS).contains(&time_steps));
        TriangleMesh {
            indices: GeometryBuffer::new(triangle_count),
            vertices: (0..time_steps)
                .map(|_| GeometryBuffer::new(vertex_count))
                .collect(),
        }
    }

    pub fn from_data(indices: Vec<Triangle<u32>>, vertices: Vec<WorldPoint>) -> Self {
        TriangleMesh {
            indices: GeometryBuffer::from_vec(indices),
            vertices: std::iter::once(GeometryBuffer::from_vec(vertices)).collect(),
        }
    }

    /// Adds vertex positions at time 1.
    pub fn with_motion(mut self, vertices_end: Vec<WorldPoint>) -> Result<Self, BufferError> {
        let expected = self.vertices[0].len();
        if vertices_end.len() != expected || self.vertices.is_full() {
            return Err(BufferError::SizeMismatch {
                expected,
                actual: vertices_end.len(),
            });
        }
        self.vertices.push(GeometryBuffer::from_vec(vertices_end));
        Ok(self)
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices[0].len()
    }

    pub fn time_steps(&self) -> usize {
        self.vertices.len()
    }

    pub fn has_motion(&self) -> bool {
        self.vertices.len() > 1
    }

    pub fn indices(&self) -> &GeometryBuffer<Triangle<u32>> {
        &self.indices
    }

    pub fn indices_mut(&mut self) -> &mut GeometryBuffer<Triangle<u32>> {
        &mut self.indices
    }

    pub fn vertices(&self, time_step: usize) -> Option<&GeometryBuffer<WorldPoint>> {
        self.vertices.get(time_step)
    }

    pub fn vertices_mut(&mut self, time_step: usize) -> Option<&mut GeometryBuffer<WorldPoint>> {
        self.vertices.get_mut(time_step)
    }

    /// All buffers have storage and every index references an existing vertex.
    pub(crate) fn validate(&self) -> Result<(), MeshError> {
        let indices = self.indices.data()?;
        for buffer in &self.vertices {
            buffer.data()?;
        }

        let vertex_count = self.vertex_count() as u32;
        match indices
            .iter()
            .position(|triangle| triangle.iter().any(|&i| i >= vertex_count))
        {
            Some(prim) => Err(MeshError::InvalidIndex(prim as u32)),
            None => Ok(()),
        }
    }

    /// Vertices of a triangle at one time step. The mesh must be valid.
    pub fn triangle(&self, prim: u32, time_step: usize) -> Triangle<WorldPoint> {
        let vertices = self.vertices[time_step].as_slice();
        self.indices.as_slice()[prim as usize].map(|&i| vertices[i as usize])
    }

    /// Triangle at time `time`, interpolated between the time steps.
    pub fn triangle_at(&self, prim: u32, time: f32) -> Triangle<WorldPoint> {
        let start = self.triangle(prim, 0);
        if self.has_motion() {
            start.lerp(&self.triangle(prim, 1), time)
        } else {
            start
        }
    }

    pub fn plane_at(&self, prim: u32, time: f32) -> TrianglePlane {
        TrianglePlane::new(&self.triangle_at(prim, time))
    }

    pub fn bounds(&self, prim: u32, time_step: usize) -> WorldBox {
        self.triangle(prim, time_step.min(self.time_steps() - 1)).bounds()
    }

    pub(crate) fn attach(&mut self, counter: &MappedCounter) {
        self.indices.attach(counter);
        for buffer in &mut self.vertices {
            buffer.attach(counter);
        }
    }
}

/// Problems found when a mesh or curve set gets validated before a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MeshError {
    Buffer(BufferError),
    InvalidIndex(u32),
}

impl From<BufferError> for MeshError {
    fn from(e: BufferError) -> Self {
        MeshError::Buffer(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::WorldVector;
    use assert2::{assert, let_assert};

    fn quad() -> TriangleMesh {
        TriangleMesh::from_data(
            vec![Triangle::new(0, 1, 2), Triangle::new(0, 2, 3)],
            vec![
                WorldPoint::new(0.0, 0.0, 0.0),
                WorldPoint::new(1.0, 0.0, 0.0),
                WorldPoint::new(1.0, 1.0, 0.0),
                WorldPoint::new(0.0, 1.0, 0.0),
            ],
        )
    }

    #[test]
    fn triangle_lookup() {
        let mesh = quad();
        assert!(mesh.validate() == Ok(()));
        assert!(mesh.triangle(1, 0)[2] == WorldPoint::new(0.0, 1.0, 0.0));
        assert!(mesh.bounds(0, 0).max == WorldPoint::new(1.0, 1.0, 0.0));
    }

    #[test]
    fn index_out_of_range_is_reported() {
        let mut mesh = quad();
        let indices = mesh.indices_mut().map().unwrap();
        indices[1] = Triangle::new(0, 2, 4);
        mesh.indices_mut().unmap().unwrap();

        assert!(mesh.validate() == Err(MeshError::InvalidIndex(1)));
    }

    #[test]
    fn unfilled_buffers_are_reported() {
        let mesh = TriangleMesh::new(2, 4, 1);
        assert!(mesh.validate() == Err(MeshError::Buffer(BufferError::Unallocated)));
    }

    #[test]
    fn motion_interpolates_vertices() {
        let offset = WorldVector::new(0.0, 0.0, 2.0);
        let end: Vec<WorldPoint> = quad().vertices(0).unwrap().as_slice().iter().map(|p| p + offset).collect();
        let mesh = quad().with_motion(end).unwrap();

        assert!(mesh.has_motion());
        assert!(mesh.triangle_at(0, 0.5)[0] == WorldPoint::new(0.0, 0.0, 1.0));
        assert!(mesh.bounds(0, 1).min.z == 2.0);
    }

    #[test]
    fn motion_buffer_must_match() {
        let_assert!(Err(BufferError::SizeMismatch { expected: 4, actual: 1 }) =
            quad().with_motion(vec![WorldPoint::origin()]));
    }
}

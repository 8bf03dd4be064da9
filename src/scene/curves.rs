use arrayvec::ArrayVec;

use super::buffer::{BufferElement, BufferError, GeometryBuffer, MappedCounter};
use super::triangle_mesh::{MAX_TIME_STEPS, MeshError};
use crate::geometry::{BezierCurve, FloatType, WorldBox, WorldPoint};

/// Control point of a curve.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CurveVertex {
    pub position: WorldPoint,
    pub radius: FloatType,
}

impl CurveVertex {
    pub fn new(position: WorldPoint, radius: FloatType) -> Self {
        CurveVertex { position, radius }
    }
}

impl BufferElement for CurveVertex {
    fn zeroed() -> Self {
        CurveVertex::new(WorldPoint::origin(), 0.0)
    }
}

/// Cubic Bezier curves, each one referencing four consecutive control points
/// starting at its entry in the curve buffer.
#[derive(Debug)]
pub struct CurveSet {
    curves: GeometryBuffer<u32>,
    vertices: ArrayVec<GeometryBuffer<CurveVertex>, MAX_TIME_STEPS>,
}

impl CurveSet {
    pub fn new(curve_count: usize, vertex_count: usize, time_steps: usize) -> Self {
        assert!((1..=MAX_TIME_STEPS).contains(&time_steps));
        CurveSet {
            curves: GeometryBuffer::new(curve_count),
            vertices: (0..time_steps)
                .map(|_| GeometryBuffer::new(vertex_count))
                .collect(),
        }
    }

    pub fn from_data(curves: Vec<u32>, vertices: Vec<CurveVertex>) -> Self {
        CurveSet {
            curves: GeometryBuffer::from_vec(curves),
            vertices: std::iter::once(GeometryBuffer::from_vec(vertices)).collect(),
        }
    }

    pub fn with_motion(mut self, vertices_end: Vec<CurveVertex>) -> Result<Self, BufferError> {
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

    pub fn curve_count(&self) -> usize {
        self.curves.len()
    }

    pub fn time_steps(&self) -> usize {
        self.vertices.len()
    }

    pub fn has_motion(&self) -> bool {
        self.vertices.len() > 1
    }

    pub fn curves_mut(&mut self) -> &mut GeometryBuffer<u32> {
        &mut self.curves
    }

    pub fn vertices_mut(&mut self, time_step: usize) -> Option<&mut GeometryBuffer<CurveVertex>> {
        self.vertices.get_mut(time_step)
    }

    pub(crate) fn validate(&self) -> Result<(), MeshError> {
        let curves = self.curves.data()?;
        for buffer in &self.vertices {
            buffer.data()?;
        }

        let vertex_count = self.vertices[0].len();
        match curves
            .iter()
            .position(|&first| first as usize + 4 > vertex_count)
        {
            Some(prim) => Err(MeshError::InvalidIndex(prim as u32)),
            None => Ok(()),
        }
    }

    pub fn curve(&self, prim: u32, time_step: usize) -> BezierCurve {
        let first = self.curves.as_slice()[prim as usize] as usize;
        let v = &self.vertices[time_step].as_slice()[first..first + 4];
        BezierCurve::new(
            std::array::from_fn(|i| v[i].position),
            std::array::from_fn(|i| v[i].radius),
        )
    }

    pub fn curve_at(&self, prim: u32, time: FloatType) -> BezierCurve {
        let start = self.curve(prim, 0);
        if self.has_motion() {
            start.lerp(&self.curve(prim, 1), time)
        } else {
            start
        }
    }

    pub fn bounds(&self, prim: u32, time_step: usize) -> WorldBox {
        self.curve(prim, time_step.min(self.time_steps() - 1)).bounds()
    }

    pub(crate) fn attach(&mut self, counter: &MappedCounter) {
        self.curves.attach(counter);
        for buffer in &mut self.vertices {
            buffer.attach(counter);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::assert;

    fn strand() -> CurveSet {
        let vertices = (0..5)
            .map(|i| CurveVertex::new(WorldPoint::new(i as f32, 0.0, 0.0), 0.25))
            .collect();
        CurveSet::from_data(vec![0, 1], vertices)
    }

    #[test]
    fn curves_share_vertices() {
        let curves = strand();
        assert!(curves.validate() == Ok(()));
        assert!(curves.curve(1, 0).points[0] == WorldPoint::new(1.0, 0.0, 0.0));
        assert!(curves.bounds(1, 0).max == WorldPoint::new(4.25, 0.25, 0.25));
    }

    #[test]
    fn curve_past_the_end_is_reported() {
        let mut curves = strand();
        curves.curves_mut().map().unwrap()[1] = 2;
        curves.curves_mut().unmap().unwrap();
        assert!(curves.validate() == Err(MeshError::InvalidIndex(1)));
    }
}

mod accel;
mod buffer;
mod curves;
mod instance;
mod intersectors;
mod triangle_mesh;

pub use accel::Accel;
pub use buffer::{BufferElement, BufferError, GeometryBuffer};
pub use curves::{CurveSet, CurveVertex};
pub use instance::{Instance, InstanceError};
pub use triangle_mesh::{MAX_TIME_STEPS, TriangleMesh};

use std::sync::Arc;
use std::sync::atomic::Ordering;

use thiserror::Error;

use crate::bvh::BuildError;
use crate::geometry::{FloatType, Ray, WorldBox, WorldVector};
use buffer::MappedCounter;
use triangle_mesh::MeshError;

pub type GeometryId = u32;

/// Callback that may veto a hit before it is accepted. Returns true to keep the hit.
pub type FilterFn = Arc<dyn Fn(&Ray, &Hit) -> bool + Send + Sync>;

/// Closest hit of a ray.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Hit {
    pub t: FloatType,
    /// Barycentric coordinates for triangles, curve parameter in `u` for curves
    pub u: FloatType,
    pub v: FloatType,
    /// Not normalized
    pub geometric_normal: WorldVector,
    pub geom_id: GeometryId,
    pub prim_id: u32,
    /// For hits inside an instance, the geometry hit in the instanced scene
    /// (`geom_id` is then the instance)
    pub inner_geom_id: Option<GeometryId>,
}

#[derive(Debug, Error)]
pub enum SceneError {
    #[error("no geometry with id {0}")]
    UnknownGeometry(GeometryId),

    #[error("primitive {prim_id} of geometry {geom_id} references data out of range")]
    InvalidIndex { geom_id: GeometryId, prim_id: u32 },

    #[error("geometry was added or removed since the last build")]
    TopologyChanged,

    #[error("{0} buffers are still mapped")]
    BuffersMapped(usize),

    #[error("buffer error in geometry {geom_id}: {source}")]
    Buffer {
        geom_id: GeometryId,
        source: BufferError,
    },

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Instance(#[from] InstanceError),
}

pub enum GeometryKind {
    Triangles(TriangleMesh),
    Curves(CurveSet),
    Instance(Instance),
}

/// One geometry of a scene together with its hit filters.
pub struct Geometry {
    kind: GeometryKind,
    intersection_filter: Option<FilterFn>,
    occlusion_filter: Option<FilterFn>,
}

impl Geometry {
    pub fn new(kind: GeometryKind) -> Self {
        Geometry {
            kind,
            intersection_filter: None,
            occlusion_filter: None,
        }
    }

    pub fn triangles(mesh: TriangleMesh) -> Self {
        Self::new(GeometryKind::Triangles(mesh))
    }

    pub fn curves(curves: CurveSet) -> Self {
        Self::new(GeometryKind::Curves(curves))
    }

    pub fn instance(instance: Instance) -> Self {
        Self::new(GeometryKind::Instance(instance))
    }

    /// Filter consulted by closest hit queries. Ignored on instances.
    pub fn with_intersection_filter(
        mut self,
        filter: impl Fn(&Ray, &Hit) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.intersection_filter = Some(Arc::new(filter));
        self
    }

    /// Filter consulted by occlusion queries. Ignored on instances.
    pub fn with_occlusion_filter(
        mut self,
        filter: impl Fn(&Ray, &Hit) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.occlusion_filter = Some(Arc::new(filter));
        self
    }

    pub fn set_intersection_filter(&mut self, filter: Option<FilterFn>) {
        self.intersection_filter = filter;
    }

    pub fn set_occlusion_filter(&mut self, filter: Option<FilterFn>) {
        self.occlusion_filter = filter;
    }

    pub fn kind(&self) -> &GeometryKind {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut GeometryKind {
        &mut self.kind
    }

    pub fn triangle_mesh_mut(&mut self) -> Option<&mut TriangleMesh> {
        match &mut self.kind {
            GeometryKind::Triangles(mesh) => Some(mesh),
            _ => None,
        }
    }

    pub fn curve_set_mut(&mut self) -> Option<&mut CurveSet> {
        match &mut self.kind {
            GeometryKind::Curves(curves) => Some(curves),
            _ => None,
        }
    }

    pub(crate) fn intersection_filter(&self) -> Option<&FilterFn> {
        self.intersection_filter.as_ref()
    }

    pub(crate) fn occlusion_filter(&self) -> Option<&FilterFn> {
        self.occlusion_filter.as_ref()
    }

    pub fn primitive_count(&self) -> usize {
        match &self.kind {
            GeometryKind::Triangles(mesh) => mesh.triangle_count(),
            GeometryKind::Curves(curves) => curves.curve_count(),
            GeometryKind::Instance(_) => 1,
        }
    }

    pub fn has_motion(&self) -> bool {
        match &self.kind {
            GeometryKind::Triangles(mesh) => mesh.has_motion(),
            GeometryKind::Curves(curves) => curves.has_motion(),
            GeometryKind::Instance(instance) => instance.has_motion(),
        }
    }

    /// Bounds of one primitive at time step 0 or 1.
    pub fn primitive_bounds(&self, prim: u32, time_step: usize) -> WorldBox {
        match &self.kind {
            GeometryKind::Triangles(mesh) => mesh.bounds(prim, time_step),
            GeometryKind::Curves(curves) => curves.bounds(prim, time_step),
            GeometryKind::Instance(instance) => instance.bounds(time_step),
        }
    }

    fn validate(&self, geom_id: GeometryId) -> Result<(), SceneError> {
        let result = match &self.kind {
            GeometryKind::Triangles(mesh) => mesh.validate(),
            GeometryKind::Curves(curves) => curves.validate(),
            GeometryKind::Instance(_) => Ok(()),
        };
        result.map_err(|e| match e {
            MeshError::Buffer(source) => SceneError::Buffer { geom_id, source },
            MeshError::InvalidIndex(prim_id) => SceneError::InvalidIndex { geom_id, prim_id },
        })
    }

    fn attach(&mut self, counter: &MappedCounter) {
        match &mut self.kind {
            GeometryKind::Triangles(mesh) => mesh.attach(counter),
            GeometryKind::Curves(curves) => curves.attach(counter),
            GeometryKind::Instance(_) => {}
        }
    }
}

impl std::fmt::Debug for Geometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            GeometryKind::Triangles(_) => "triangles",
            GeometryKind::Curves(_) => "curves",
            GeometryKind::Instance(_) => "instance",
        };
        f.debug_struct("Geometry")
            .field("kind", &kind)
            .field("primitives", &self.primitive_count())
            .field("intersection_filter", &self.intersection_filter.is_some())
            .field("occlusion_filter", &self.occlusion_filter.is_some())
            .finish()
    }
}

/// Geometries addressed by id. Ids of removed geometries are not reused.
#[derive(Debug, Default)]
pub struct Scene {
    geometries: Vec<Option<Geometry>>,
    mapped_buffers: MappedCounter,
    /// Bumped whenever geometry is added or removed
    topology_generation: u64,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, mut geometry: Geometry) -> GeometryId {
        geometry.attach(&self.mapped_buffers);
        self.geometries.push(Some(geometry));
        self.topology_generation += 1;
        (self.geometries.len() - 1) as GeometryId
    }

    pub fn remove(&mut self, geom_id: GeometryId) -> Result<Geometry, SceneError> {
        let mut geometry = self
            .geometries
            .get_mut(geom_id as usize)
            .and_then(Option::take)
            .ok_or(SceneError::UnknownGeometry(geom_id))?;
        // The removed geometry no longer holds this scene back
        geometry.attach(&MappedCounter::default());
        self.topology_generation += 1;
        Ok(geometry)
    }

    pub fn geometry(&self, geom_id: GeometryId) -> Result<&Geometry, SceneError> {
        self.geometries
            .get(geom_id as usize)
            .and_then(Option::as_ref)
            .ok_or(SceneError::UnknownGeometry(geom_id))
    }

    pub fn geometry_mut(&mut self, geom_id: GeometryId) -> Result<&mut Geometry, SceneError> {
        self.geometries
            .get_mut(geom_id as usize)
            .and_then(Option::as_mut)
            .ok_or(SceneError::UnknownGeometry(geom_id))
    }

    /// Geometry referenced by a built tree. Removing geometry forces a rebuild,
    /// so a missing one is a bug.
    pub(crate) fn built_geometry(&self, geom_id: GeometryId) -> &Geometry {
        match self.geometries.get(geom_id as usize) {
            Some(Some(geometry)) => geometry,
            _ => panic!("geometry {geom_id} referenced by the tree is gone"),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (GeometryId, &Geometry)> {
        self.geometries
            .iter()
            .enumerate()
            .filter_map(|(id, g)| Some((id as GeometryId, g.as_ref()?)))
    }

    pub fn instance_ids(&self) -> impl Iterator<Item = GeometryId> {
        self.iter()
            .filter(|(_, g)| matches!(g.kind(), GeometryKind::Instance(_)))
            .map(|(id, _)| id)
    }

    pub fn mapped_buffer_count(&self) -> usize {
        self.mapped_buffers.load(Ordering::Relaxed)
    }

    pub fn topology_generation(&self) -> u64 {
        self.topology_generation
    }

    pub fn has_motion(&self) -> bool {
        self.iter().any(|(_, g)| g.has_motion())
    }

    pub fn primitive_count(&self) -> usize {
        self.iter().map(|(_, g)| g.primitive_count()).sum()
    }

    /// Checks that the scene can be built: no buffer is mapped and all geometry data is consistent.
    pub fn validate(&self) -> Result<(), SceneError> {
        let mapped = self.mapped_buffer_count();
        if mapped > 0 {
            return Err(SceneError::BuffersMapped(mapped));
        }
        self.iter().try_for_each(|(id, g)| g.validate(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Triangle, WorldPoint};
    use assert2::{assert, let_assert};

    fn triangle_mesh() -> TriangleMesh {
        TriangleMesh::from_data(
            vec![Triangle::new(0, 1, 2)],
            vec![
                WorldPoint::new(0.0, 0.0, 0.0),
                WorldPoint::new(1.0, 0.0, 0.0),
                WorldPoint::new(0.0, 1.0, 0.0),
            ],
        )
    }

    #[test]
    fn ids_are_not_reused() {
        let mut scene = Scene::new();
        let a = scene.add(Geometry::triangles(triangle_mesh()));
        let b = scene.add(Geometry::triangles(triangle_mesh()));
        scene.remove(a).unwrap();
        let c = scene.add(Geometry::triangles(triangle_mesh()));

        assert!((a, b, c) == (0, 1, 2));
        let_assert!(Err(SceneError::UnknownGeometry(0)) = scene.geometry(a));
        assert!(scene.iter().map(|(id, _)| id).collect::<Vec<_>>() == [1, 2]);
        assert!(scene.primitive_count() == 2);
    }

    #[test]
    fn removing_twice_fails() {
        let mut scene = Scene::new();
        let id = scene.add(Geometry::triangles(triangle_mesh()));
        scene.remove(id).unwrap();
        let_assert!(Err(SceneError::UnknownGeometry(_)) = scene.remove(id));
    }

    #[test]
    fn mapped_buffers_block_validation() {
        let mut scene = Scene::new();
        let id = scene.add(Geometry::triangles(triangle_mesh()));
        let mesh = scene.geometry_mut(id).unwrap().triangle_mesh_mut().unwrap();
        mesh.vertices_mut(0).unwrap().map().unwrap();

        assert!(scene.mapped_buffer_count() == 1);
        let_assert!(Err(SceneError::BuffersMapped(1)) = scene.validate());

        let mesh = scene.geometry_mut(id).unwrap().triangle_mesh_mut().unwrap();
        mesh.vertices_mut(0).unwrap().unmap().unwrap();
        assert!(scene.validate().is_ok());
    }

    #[test]
    fn removing_mapped_geometry_releases_the_scene() {
        let mut scene = Scene::new();
        let id = scene.add(Geometry::triangles(triangle_mesh()));
        let mesh = scene.geometry_mut(id).unwrap().triangle_mesh_mut().unwrap();
        mesh.indices_mut().map().unwrap();

        scene.remove(id).unwrap();
        assert!(scene.mapped_buffer_count() == 0);
    }

    #[test]
    fn invalid_index_names_the_primitive() {
        let mut scene = Scene::new();
        scene.add(Geometry::triangles(triangle_mesh()));
        let mesh = TriangleMesh::from_data(
            vec![Triangle::new(0, 1, 2), Triangle::new(0, 1, 7)],
            vec![WorldPoint::origin(); 3],
        );
        scene.add(Geometry::triangles(mesh));

        let_assert!(Err(SceneError::InvalidIndex { geom_id: 1, prim_id: 1 }) = scene.validate());
    }

    #[test]
    fn filters_show_in_debug_output() {
        let geometry = Geometry::triangles(triangle_mesh()).with_occlusion_filter(|_, _| false);
        let text = format!("{geometry:?}");
        assert!(text.contains("occlusion_filter: true"));
        assert!(text.contains("intersection_filter: false"));
    }
}

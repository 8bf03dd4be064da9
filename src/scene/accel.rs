use tracing::debug;

use super::intersectors::{PrimRef, SceneIntersector, ScenePrimitives, collect_primitives};
use super::{Hit, Scene, SceneError};
use crate::bvh::{
    BuildSettings, Bvh, MortonBuilder, RefitStats, RotateSettings, RotationStats,
};
use crate::geometry::{PACKET_WIDTH, Ray, RayPacket};

/// A scene together with the tree built over its primitives.
///
/// Queries against an accel that was never built, or whose scene gained or lost
/// geometry since the last build, miss everything.
#[derive(Debug)]
pub struct Accel {
    scene: Scene,
    builder: MortonBuilder,
    bvh: Bvh,
    prims: Vec<PrimRef>,
    /// Scene topology the tree was built for
    built_generation: Option<u64>,
}

impl Accel {
    pub fn new(scene: Scene, settings: BuildSettings) -> Self {
        Accel {
            scene,
            builder: MortonBuilder::new(settings),
            bvh: Bvh::empty(),
            prims: Vec::new(),
            built_generation: None,
        }
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    /// Geometry edits through this take effect on the next `build` or `refit`.
    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut self.scene
    }

    pub fn bvh(&self) -> &Bvh {
        &self.bvh
    }

    pub fn is_built(&self) -> bool {
        self.built_generation == Some(self.scene.topology_generation())
    }

    /// Builds a new tree over all primitives of the scene.
    /// On error the previous tree is kept.
    pub fn build(&mut self) -> Result<(), SceneError> {
        self.scene.validate()?;

        let prims = collect_primitives(&self.scene);
        let bvh = self
            .builder
            .build(&ScenePrimitives::new(&self.scene, &prims))?;

        self.bvh = bvh;
        self.prims = prims;
        self.built_generation = Some(self.scene.topology_generation());
        Ok(())
    }

    pub fn rotate(&mut self, settings: &RotateSettings) -> RotationStats {
        self.bvh.rotate(settings)
    }

    /// Updates the tree's bounds to moved vertices.
    /// Fails if geometry was added or removed since the build.
    pub fn refit(&mut self) -> Result<RefitStats, SceneError> {
        if !self.is_built() {
            return Err(SceneError::TopologyChanged);
        }
        self.scene.validate()?;

        let stats = self
            .bvh
            .refit(&ScenePrimitives::new(&self.scene, &self.prims));
        debug!(nodes = stats.nodes, leaves = stats.leaves, "refitted scene");
        Ok(stats)
    }

    fn intersector(&self) -> SceneIntersector<'_> {
        SceneIntersector::new(&self.scene, &self.prims)
    }

    /// Closest hit within the ray's range, shrinking `ray.tfar` on hit.
    pub fn intersect(&self, ray: &mut Ray) -> Option<Hit> {
        if !self.is_built() {
            return None;
        }
        self.bvh.intersect_with(ray, &self.intersector())
    }

    pub fn occluded(&self, ray: &Ray) -> bool {
        self.is_built() && self.bvh.occluded_with(ray, &self.intersector())
    }

    pub fn intersect_packet(&self, packet: &mut RayPacket) -> [Option<Hit>; PACKET_WIDTH] {
        if !self.is_built() {
            return [None; PACKET_WIDTH];
        }
        self.bvh.intersect_packet_with(packet, &self.intersector())
    }

    /// Mask of the lanes whose rays are blocked.
    pub fn occluded_packet(&self, packet: &RayPacket) -> u8 {
        if !self.is_built() {
            return 0;
        }
        self.bvh.occluded_packet_with(packet, &self.intersector())
    }
}

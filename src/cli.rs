use std::num::NonZeroUsize;
use std::time::Instant;

use anyhow::Context as _;
use indicatif::ProgressBar;
use minibvh::{
    Accel, Geometry, Scene,
    bvh::{BuildSettings, RotateSettings},
    geometry::{PACKET_WIDTH, Ray, RayPacket, Triangle, WorldPoint, WorldVector},
    scene::TriangleMesh,
    sync::WorkerCount,
};
use rand::{Rng as _, SeedableRng as _, rngs::SmallRng};
use rand_distr::{Distribution as _, UnitSphere};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Parses the positional argument at `index`, or returns `default` if it is missing.
fn arg<T: std::str::FromStr>(index: usize, name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::args().nth(index) {
        Some(value) => value
            .parse()
            .with_context(|| format!("invalid {name}: {value:?}")),
        None => Ok(default),
    }
}

fn random_direction(rng: &mut SmallRng) -> WorldVector {
    let [x, y, z]: [f32; 3] = UnitSphere.sample(rng);
    WorldVector::new(x, y, z)
}

/// Small triangles scattered through a cube of side 100.
fn random_mesh(triangle_count: usize, rng: &mut SmallRng) -> TriangleMesh {
    let vertices = (0..triangle_count)
        .flat_map(|_| {
            let center = WorldPoint::new(
                rng.random_range(-50.0..50.0),
                rng.random_range(-50.0..50.0),
                rng.random_range(-50.0..50.0),
            );
            let corners: [WorldPoint; 3] =
                std::array::from_fn(|_| center + random_direction(rng) * 0.5);
            corners
        })
        .collect();
    let triangles = (0..triangle_count as u32)
        .map(|i| Triangle::new(3 * i, 3 * i + 1, 3 * i + 2))
        .collect();
    TriangleMesh::from_data(triangles, vertices)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let triangle_count: usize = arg(1, "triangle count", 1_000_000)?;
    let ray_count: usize = arg(2, "ray count", 1 << 20)?;
    let worker_count = match arg::<usize>(3, "thread count", 0)? {
        0 => WorkerCount::Auto,
        n => WorkerCount::Manual(NonZeroUsize::new(n).context("thread count")?),
    };

    let mut rng = SmallRng::seed_from_u64(0x5eed);
    let mut scene = Scene::new();
    scene.add(Geometry::triangles(random_mesh(triangle_count, &mut rng)));

    let settings = BuildSettings::builder().worker_count(worker_count).build();
    let mut accel = Accel::new(scene, settings);

    let start = Instant::now();
    accel.build()?;
    info!(elapsed = ?start.elapsed(), triangle_count, "built");

    let rotation = accel.rotate(&RotateSettings::default());
    let refit = accel.refit()?;
    info!(swaps = rotation.swaps, refitted_nodes = refit.nodes, "optimized");
    accel.bvh().print_statistics();

    let rays: Vec<Ray> = (0..ray_count)
        .map(|_| Ray::new(WorldPoint::origin(), random_direction(&mut rng)))
        .collect();

    let bar = ProgressBar::new(ray_count as u64);
    let start = Instant::now();
    let mut hits = 0usize;
    for chunk in rays.chunks(PACKET_WIDTH) {
        let mut packet = RayPacket::from_rays(chunk);
        hits += accel
            .intersect_packet(&mut packet)
            .iter()
            .filter(|hit| hit.is_some())
            .count();
        bar.inc(chunk.len() as u64);
    }
    bar.finish_and_clear();
    let elapsed = start.elapsed();

    info!(
        ?elapsed,
        hits,
        mrays_per_second = ray_count as f64 / elapsed.as_secs_f64() / 1e6,
        "traced packets"
    );

    let occluded = rays.iter().filter(|ray| accel.occluded(ray)).count();
    info!(occluded, "traced shadow rays");

    Ok(())
}

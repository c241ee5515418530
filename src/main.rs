use std::time::Instant;

use glam::Vec3;
use pathtracer_fb::raytracer::exporter::{Exporter, PngExporter};
use pathtracer_fb::raytracer::renderer::SphereScene;
use pathtracer_fb::{
    AdaptiveSamplingConfig, Camera, FrameBuffer, LoadBalancer, LocalFrameBuffer, MultiDeviceLoadBalancer,
    ParallelRenderLoop, RenderConfig, Result,
};

const USAGE: &str = "usage: pathtracer-fb [--size WxH] [--frames N] [--threshold T] [--spp N] [--devices N] \
                     [--task-size N] [--format rgba8|srgba|rgba32f] [--op NAME]... [--no-ops] [-o PATH]";

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = RenderConfig::from_args(std::env::args().skip(1)).unwrap_or_else(|e| {
        eprintln!("{}", e);
        eprintln!("{}", USAGE);
        std::process::exit(2);
    });

    if let Err(e) = run(&config) {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

fn run(config: &RenderConfig) -> Result<()> {
    config.validate()?;
    let ops = config.image_op_descs()?;

    let mut framebuffer = LocalFrameBuffer::with_desc(config.framebuffer_desc())?;
    framebuffer.set_image_ops(ops.clone());
    framebuffer.commit()?;

    let camera = Camera::for_image(Vec3::new(0.0, 1.4, 4.2), Vec3::new(0.0, 0.5, 0.0), 45.0, config.size);
    let scene = SphereScene::default();

    println!(
        "Rendering {}x{} at {} spp/frame, threshold {}, up to {} frames",
        config.size.x, config.size.y, config.adaptive.samples_per_pixel, config.adaptive.error_threshold, config.adaptive.max_frames
    );

    if config.devices > 0 {
        let mut balancer = MultiDeviceLoadBalancer::new(config.framebuffer_desc(), config.devices)?;
        balancer.set_image_ops(&ops)?;
        println!("Composing {} sparse devices", balancer.num_devices());
        render_frames(&mut balancer, &mut framebuffer, &scene, &camera, &config.adaptive);
    } else {
        render_frames(&mut ParallelRenderLoop, &mut framebuffer, &scene, &camera, &config.adaptive);
    }

    PngExporter::color().export(&framebuffer, &config.output)?;
    Ok(())
}

fn render_frames<B: LoadBalancer<LocalFrameBuffer>>(
    balancer: &mut B,
    framebuffer: &mut LocalFrameBuffer,
    scene: &SphereScene,
    camera: &Camera,
    adaptive: &AdaptiveSamplingConfig,
) {
    let total_tasks = framebuffer.total_render_tasks();
    let start = Instant::now();
    let mut pixels = 0usize;

    for frame in 0..adaptive.max_frames {
        let stats = balancer.render_frame(framebuffer, scene, camera, adaptive);
        pixels += stats.pixels_rendered;

        if stats.converged() {
            println!("  Converged after {} frames", frame);
            break;
        }
        if (frame + 1) % 8 == 0 {
            let elapsed = start.elapsed().as_secs_f64();
            println!(
                "  Frame {}: {}/{} tasks active, error {:.4}, {:.2} Msamples/sec",
                frame + 1,
                stats.tasks_rendered,
                total_tasks,
                stats.variance,
                pixels as f64 * adaptive.samples_per_pixel as f64 / elapsed / 1_000_000.0
            );
        }
    }

    println!();
    println!("Results:");
    println!("  Render time:  {:.3}s", start.elapsed().as_secs_f32());
    println!("  Frames:       {}", framebuffer.frame_id() + 1);
    println!("  Final error:  {:.5}", framebuffer.variance());
}

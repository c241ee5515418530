use std::sync::Arc;
use std::thread;

use glam::{UVec2, Vec4};
use pathtracer_fb::raytracer::tile::{num_tiles, tile_region};
use pathtracer_fb::{
    Channel, ChannelData, ChannelFlags, ColorFormat, FrameBuffer, FrameBufferDesc, FrameBufferError, LocalFrameBuffer,
    Sample, SparseFrameBuffer, SyncEvent, Tile,
};

fn desc(size: UVec2) -> FrameBufferDesc {
    FrameBufferDesc::new(
        size,
        ColorFormat::Rgba32f,
        ChannelFlags::COLOR | ChannelFlags::ACCUM | ChannelFlags::VARIANCE | ChannelFlags::DEPTH,
    )
}

/// Sample value for a pixel in a given pass, distinct per pixel and pass.
fn value(p: UVec2, pass: u32) -> f32 {
    ((p.x * 7 + p.y * 13 + pass * 29) % 17) as f32 / 16.0
}

fn pass_tiles(size: UVec2, pass: u32) -> Vec<Tile> {
    let n = num_tiles(size);
    (0..n.x * n.y)
        .map(|id| {
            let mut tile = Tile::new(tile_region(id, size), pass as i32);
            for (p, s) in tile.iter_mut() {
                let v = value(p, pass);
                *s = Sample {
                    depth: 1.0 + v,
                    ..Sample::with_color(Vec4::new(v, v, v, 1.0))
                };
            }
            tile
        })
        .collect()
}

fn accum(fb: &LocalFrameBuffer) -> Vec<Vec4> {
    match fb.map_buffer(Channel::Accum).unwrap().data() {
        ChannelData::Rgba32f(d) => d.to_vec(),
        other => panic!("unexpected layout {other:?}"),
    }
}

#[test]
fn test_final_mean_is_order_independent() {
    let size = UVec2::new(150, 90);
    let passes = 5;
    let mut forward = LocalFrameBuffer::with_desc(desc(size)).unwrap();
    let mut shuffled = LocalFrameBuffer::with_desc(desc(size)).unwrap();

    for pass in 0..passes {
        forward.begin_frame();
        forward.accumulate_tiles(&mut pass_tiles(size, pass));

        shuffled.begin_frame();
        let mut tiles = pass_tiles(size, pass);
        tiles.reverse();
        tiles.rotate_left(pass as usize % 3);
        for tile in &mut tiles {
            shuffled.accumulate(tile);
        }
    }

    let a = accum(&forward);
    let b = accum(&shuffled);
    for (i, (x, y)) in a.iter().zip(&b).enumerate() {
        let p = UVec2::new(i as u32 % size.x, i as u32 / size.x);
        let mean = (0..passes).map(|pass| value(p, pass)).sum::<f32>() / passes as f32;
        assert!((x.x - mean).abs() < 1e-5, "pixel {p}: {} != {mean}", x.x);
        assert!((x.x - y.x).abs() < 1e-6);
    }
}

#[test]
fn test_clear_without_samples_has_infinite_variance() {
    let size = UVec2::new(64, 64);
    let mut fb = LocalFrameBuffer::with_desc(desc(size)).unwrap();
    for pass in 0..3 {
        fb.begin_frame();
        fb.accumulate_tiles(&mut pass_tiles(size, pass));
        fb.end_frame(0.01, None);
    }
    assert!(fb.variance().is_finite());

    fb.clear();
    assert_eq!(fb.variance(), f32::INFINITY);
    fb.begin_frame();
    fb.end_frame(0.01, None);
    assert_eq!(fb.variance(), f32::INFINITY);
}

#[test]
fn test_sparse_composition_matches_dense() {
    let size = UVec2::new(130, 70);
    let d = desc(size);
    let mut dense = LocalFrameBuffer::with_desc(d).unwrap();
    let mut composed = LocalFrameBuffer::with_desc(d).unwrap();
    let mut even = SparseFrameBuffer::new(d, &[0, 2, 4]).unwrap();
    let mut odd = SparseFrameBuffer::new(d, &[1, 3, 5]).unwrap();

    for pass in 0..4 {
        dense.begin_frame();
        even.begin_frame();
        odd.begin_frame();
        dense.accumulate_tiles(&mut pass_tiles(size, pass));
        for mut tile in pass_tiles(size, pass) {
            if even.try_accumulate(&mut tile).is_err() {
                odd.try_accumulate(&mut tile).unwrap();
            }
        }
        dense.end_frame(0.01, None);
        even.end_frame(0.01, None);
        odd.end_frame(0.01, None);
    }

    composed.write_sparse(&even).unwrap();
    composed.write_sparse(&odd).unwrap();

    let color = |fb: &LocalFrameBuffer| match fb.map_buffer(Channel::Color).unwrap().data() {
        ChannelData::Rgba32f(d) => d.to_vec(),
        other => panic!("unexpected layout {other:?}"),
    };
    assert_eq!(color(&dense), color(&composed));
    for task in 0..dense.total_render_tasks() {
        assert_eq!(composed.task_accum_id(task), 4);
    }
}

#[test]
fn test_sparse_composition_requires_matching_task_size() {
    let size = UVec2::new(64, 64);
    let mut dense = LocalFrameBuffer::with_desc(desc(size)).unwrap();
    let sparse = SparseFrameBuffer::new(desc(size).with_render_task_size(UVec2::new(16, 16)), &[0]).unwrap();
    assert!(matches!(
        dense.write_sparse(&sparse),
        Err(FrameBufferError::MismatchedRenderTaskSize { .. })
    ));
}

#[test]
fn test_invalid_configurations_fail_at_construction() {
    assert!(matches!(
        LocalFrameBuffer::new(UVec2::new(0, 8), ColorFormat::Srgba, ChannelFlags::COLOR),
        Err(FrameBufferError::InvalidSize { .. })
    ));
    assert!(matches!(
        LocalFrameBuffer::new(UVec2::new(8, 8), ColorFormat::Srgba, ChannelFlags::COLOR | ChannelFlags::VARIANCE),
        Err(FrameBufferError::InvalidChannels { .. })
    ));
    let d = desc(UVec2::new(8, 8)).with_render_task_size(UVec2::new(128, 8));
    assert!(matches!(
        SparseFrameBuffer::new(d, &[0]),
        Err(FrameBufferError::InvalidRenderTaskSize { .. })
    ));
}

#[test]
fn test_events_are_observable_from_other_threads() {
    let size = UVec2::new(64, 64);
    let mut fb = LocalFrameBuffer::with_desc(desc(size)).unwrap();
    fb.begin_frame();
    let status = Arc::clone(fb.status());

    let waiter = {
        let status = Arc::clone(&status);
        thread::spawn(move || {
            status.wait_for_event(SyncEvent::FrameFinished);
            status.progress()
        })
    };

    assert_eq!(fb.current_progress(), 0.0);
    fb.accumulate_tiles(&mut pass_tiles(size, 0));
    assert_eq!(fb.current_progress(), 1.0);
    status.set_completed(SyncEvent::WorldRendered);
    fb.end_frame(0.0, None);
    fb.post_process();
    status.set_completed(SyncEvent::FrameFinished);

    assert_eq!(waiter.join().unwrap(), 1.0);
    assert_eq!(fb.status().latest_complete_event(), SyncEvent::FrameFinished);
}

//! End-to-end frames over the headless backend.

mod common;

use std::sync::Arc;

use maprender_core::RendererConfig;
use maprender_renderer::{FrameStatus, RenderPassKind, RenderTree, Renderer};
use maprender_rhi::{
    AcquireOutcome, HeadlessBackend, PresentOutcome, RecordedCommand, Size, SubpassContents,
};
use maprender_scheduler::{Scheduler, ThreadedScheduler};

use common::{count, fill_group, fill_order, renderer};

/// Six groups, each painting one tile in both passes.
fn six_groups(renderer: &mut Renderer) {
    for i in 0..6 {
        for pass in [RenderPassKind::Opaque, RenderPassKind::Translucent] {
            let prefix = if pass == RenderPassKind::Opaque { "o" } else { "t" };
            let name = format!("{}{}", prefix, i);
            renderer.add_layer_group(Box::new(fill_group(&name, i, 0..1, pass)));
        }
    }
}

#[test]
fn test_two_workers_six_groups_keep_layer_order() -> anyhow::Result<()> {
    let (backend, mut renderer) = renderer(RendererConfig::default().with_worker_threads(2))?;
    six_groups(&mut renderer);

    assert_eq!(renderer.render(&RenderTree::default())?, FrameStatus::Ready);

    let submission = backend
        .last_submission()
        .expect("frame should have been submitted");
    let order = fill_order(&submission.commands);
    let opaque: Vec<&str> = order
        .iter()
        .filter_map(|name| name.strip_prefix('o'))
        .collect();
    let translucent: Vec<&str> = order
        .iter()
        .filter_map(|name| name.strip_prefix('t'))
        .collect();
    assert_eq!(opaque, vec!["5", "4", "3", "2", "1", "0"]);
    assert_eq!(translucent, vec!["0", "1", "2", "3", "4", "5"]);

    // Both secondaries were executed into the primary, submitted after
    // the upload buffer.
    let primary = submission.command_buffers[1];
    let executed: Vec<usize> = backend
        .commands(primary)
        .iter()
        .filter_map(|command| match command {
            RecordedCommand::ExecuteCommands(buffers) => Some(buffers.len()),
            _ => None,
        })
        .collect();
    assert_eq!(executed, vec![2]);
    Ok(())
}

#[test]
fn test_threaded_and_serial_frames_draw_the_same() -> anyhow::Result<()> {
    let mut orders = Vec::new();
    for threads in [0, 1, 3] {
        let (backend, mut renderer) =
            renderer(RendererConfig::default().with_worker_threads(threads))?;
        six_groups(&mut renderer);
        renderer.render(&RenderTree::default())?;
        let submission = backend.last_submission().expect("submitted");

        let contents = submission.commands.iter().find_map(|command| match command {
            RecordedCommand::BeginRenderPass { contents, .. } => Some(*contents),
            _ => None,
        });
        let expected = if threads == 0 {
            SubpassContents::Inline
        } else {
            SubpassContents::SecondaryCommandBuffers
        };
        assert_eq!(contents, Some(expected), "{} thread(s)", threads);

        let order = fill_order(&submission.commands);
        let mut opaque: Vec<String> =
            order.iter().filter(|n| n.starts_with('o')).cloned().collect();
        let translucent: Vec<String> =
            order.iter().filter(|n| n.starts_with('t')).cloned().collect();
        opaque.extend(translucent);
        orders.push(opaque);
    }
    assert!(orders.windows(2).all(|pair| pair[0] == pair[1]));
    Ok(())
}

#[test]
fn test_shared_scheduler_drives_encoding() -> anyhow::Result<()> {
    let backend = Arc::new(HeadlessBackend::new(Size::new(64, 64)));
    let scheduler: Arc<dyn Scheduler> = Arc::new(ThreadedScheduler::new(3, "shared")?);
    let mut renderer = Renderer::with_scheduler(
        backend.clone(),
        Arc::new(common::Shaders::default()),
        RendererConfig::default(),
        Some(Arc::clone(&scheduler)),
    )?;
    assert_eq!(renderer.context().worker_threads(), 3);
    six_groups(&mut renderer);
    renderer.render(&RenderTree::default())?;

    let primary = backend.last_submission().expect("submitted").command_buffers[1];
    let secondaries: Vec<_> = backend
        .commands(primary)
        .iter()
        .filter_map(|command| match command {
            RecordedCommand::ExecuteCommands(buffers) => Some(buffers.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(secondaries.len(), 1);
    assert_eq!(secondaries[0].len(), 3);
    Ok(())
}

#[test]
fn test_out_of_date_frame_is_skipped_then_recovers() -> anyhow::Result<()> {
    let (backend, mut renderer) = renderer(RendererConfig::default().with_worker_threads(0))?;
    six_groups(&mut renderer);
    backend.push_acquire_outcome(AcquireOutcome::OutOfDate);
    backend.push_acquire_outcome(AcquireOutcome::OutOfDate);

    assert_eq!(renderer.render(&RenderTree::default())?, FrameStatus::Skipped);
    assert!(backend.submissions().is_empty());

    assert_eq!(renderer.render(&RenderTree::default())?, FrameStatus::Ready);
    assert_eq!(backend.submissions().len(), 1);
    assert_eq!(backend.surface_recreations(), 2);

    let stats = renderer.stats();
    assert_eq!(stats.frames_skipped, 1);
    assert_eq!(stats.frames_rendered, 1);
    Ok(())
}

#[test]
fn test_out_of_date_present_rebuilds_before_next_frame() -> anyhow::Result<()> {
    let (backend, mut renderer) = renderer(RendererConfig::default().with_worker_threads(0))?;
    backend.push_present_outcome(PresentOutcome::OutOfDate);

    assert_eq!(renderer.render(&RenderTree::default())?, FrameStatus::Skipped);
    // The frame was submitted, so the ring still advances.
    assert_eq!(renderer.frame_number(), 1);
    assert_eq!(renderer.context().current_frame_index(), 1);
    assert!(renderer.context().is_surface_update_requested());

    assert_eq!(renderer.render(&RenderTree::default())?, FrameStatus::Ready);
    assert_eq!(backend.surface_recreations(), 1);
    // Recreation restarts the ring.
    assert_eq!(renderer.context().current_frame_index(), 1);
    Ok(())
}

#[test]
fn test_draw_calls_counted_per_frame() -> anyhow::Result<()> {
    let (_backend, mut renderer) = renderer(RendererConfig::default().with_worker_threads(2))?;
    six_groups(&mut renderer);

    for _ in 0..3 {
        renderer.render(&RenderTree::default())?;
        // Twelve fills of the same tile, and one clip mask per worker: each
        // worker reuses its mask across both passes.
        assert_eq!(renderer.stats().draw_calls, 14);
        assert_eq!(renderer.stats().stencil_clears, 0);
    }
    assert_eq!(renderer.stats().total_draw_calls, 42);
    assert_eq!(renderer.timer().frames(), 3);
    Ok(())
}

#[test]
fn test_disabled_groups_are_not_drawn() -> anyhow::Result<()> {
    let (backend, mut renderer) = renderer(RendererConfig::default().with_worker_threads(2))?;
    let mut hidden = fill_group("hidden", 0, 0..2, RenderPassKind::Translucent);
    hidden.set_enabled(false);
    renderer.add_layer_group(Box::new(hidden));
    renderer.add_layer_group(Box::new(fill_group(
        "shown",
        1,
        0..2,
        RenderPassKind::Translucent,
    )));

    renderer.render(&RenderTree::default())?;
    let submission = backend.last_submission().expect("submitted");
    assert_eq!(fill_order(&submission.commands), vec!["shown", "shown"]);
    assert_eq!(
        count(&submission.commands, |c| matches!(
            c,
            RecordedCommand::DrawIndexed { .. }
        )),
        4
    );
    Ok(())
}

#[test]
fn test_deep_ring_with_many_workers_renders() -> anyhow::Result<()> {
    // Thread-scaled pool bases smaller than one batch of per-frame sets.
    let configs = [
        RendererConfig::default()
            .with_worker_threads(4)
            .with_frames_in_flight(RendererConfig::MAX_FRAMES_IN_FLIGHT),
        RendererConfig::default().with_worker_threads(9),
    ];
    for config in configs {
        let frames = config.frames_in_flight;
        let (backend, mut renderer) = renderer(config)?;
        six_groups(&mut renderer);

        for _ in 0..frames + 1 {
            assert_eq!(renderer.render(&RenderTree::default())?, FrameStatus::Ready);
        }
        assert_eq!(backend.submissions().len(), frames + 1);
        let submission = backend.last_submission().expect("submitted");
        assert_eq!(fill_order(&submission.commands).len(), 12);
    }
    Ok(())
}

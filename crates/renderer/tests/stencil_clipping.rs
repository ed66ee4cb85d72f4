//! Tile clipping masks across the groups of a frame.

mod common;

use maprender_core::RendererConfig;
use maprender_renderer::{RenderPassKind, RenderTree};
use maprender_rhi::RecordedCommand;

use common::{count, fill_group, renderer, stencil_references};

const PASS: RenderPassKind = RenderPassKind::Translucent;

fn mask_draws(commands: &[RecordedCommand]) -> usize {
    count(commands, |command| {
        matches!(command, RecordedCommand::PushConstants { data, .. } if data.len() == 64)
    })
}

#[test]
fn test_identical_tiles_reuse_masks() -> anyhow::Result<()> {
    let (backend, mut renderer) = renderer(RendererConfig::default().with_worker_threads(0))?;
    renderer.add_layer_group(Box::new(fill_group("a", 0, 0..2, PASS)));
    renderer.add_layer_group(Box::new(fill_group("b", 1, 0..2, PASS)));
    renderer.add_layer_group(Box::new(fill_group("c", 2, 0..3, PASS)));

    renderer.render(&RenderTree::default())?;
    let commands = backend.last_submission().expect("submitted").commands;

    // a: masks 1, 2 then fills. b: fills only. c: a mask for the new
    // tile, then fills.
    assert_eq!(
        stencil_references(&commands),
        vec![1, 2, 1, 2, 1, 2, 3, 1, 2, 3]
    );
    assert_eq!(mask_draws(&commands), 3);

    let stats = renderer.stats();
    assert_eq!(stats.stencil_updates, 2);
    assert_eq!(stats.stencil_clears, 0);
    Ok(())
}

#[test]
fn test_masks_restart_every_frame() -> anyhow::Result<()> {
    let (backend, mut renderer) = renderer(RendererConfig::default().with_worker_threads(0))?;
    renderer.add_layer_group(Box::new(fill_group("a", 0, 0..2, PASS)));

    for _ in 0..2 {
        renderer.render(&RenderTree::default())?;
        let commands = backend.last_submission().expect("submitted").commands;
        assert_eq!(stencil_references(&commands), vec![1, 2, 1, 2]);
    }
    Ok(())
}

#[test]
fn test_exhausted_ids_clear_and_renumber() -> anyhow::Result<()> {
    let (backend, mut renderer) = renderer(RendererConfig::default().with_worker_threads(0))?;
    renderer.add_layer_group(Box::new(fill_group("wide", 0, 0..200, PASS)));
    renderer.add_layer_group(Box::new(fill_group("other", 1, 200..300, PASS)));

    renderer.render(&RenderTree::default())?;
    let commands = backend.last_submission().expect("submitted").commands;

    let clears: Vec<usize> = commands
        .iter()
        .enumerate()
        .filter(|(_, command)| matches!(command, RecordedCommand::ClearStencil(_)))
        .map(|(index, _)| index)
        .collect();
    // The pass load clears without a command; only the overflow records one.
    assert_eq!(clears.len(), 1);
    assert_eq!(renderer.stats().stencil_clears, 1);

    // After the clear the second group's masks are numbered from 1.
    let after: Vec<u32> = stencil_references(&commands[clears[0]..]);
    assert_eq!(&after[..3], &[1, 2, 3]);
    assert_eq!(mask_draws(&commands), 300);
    Ok(())
}

#[test]
fn test_each_worker_masks_its_own_slice() -> anyhow::Result<()> {
    let (backend, mut renderer) = renderer(RendererConfig::default().with_worker_threads(2))?;
    for i in 0..4 {
        renderer.add_layer_group(Box::new(fill_group(&format!("g{}", i), i, 0..2, PASS)));
    }

    renderer.render(&RenderTree::default())?;
    let commands = backend.last_submission().expect("submitted").commands;

    // Secondary 0 holds g0 and g1, secondary 1 holds g2 and g3: each
    // draws the two masks once.
    assert_eq!(mask_draws(&commands), 4);
    assert_eq!(
        stencil_references(&commands),
        vec![1, 2, 1, 2, 1, 2, 1, 2, 1, 2, 1, 2]
    );
    Ok(())
}

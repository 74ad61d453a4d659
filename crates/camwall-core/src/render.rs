//! Presentation of decoded frames.
//!
//! The core does not draw anything itself. It hands each newly published
//! frame to a [`Renderer`] from a single render loop, which sleeps on the
//! slot table's change notifications instead of polling. Sessions never
//! wait on the renderer: they publish into the table and carry on reading.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::slots::{SlotId, SlotTable};

/// One decoded frame, borrowed for the duration of a [`Renderer::present`] call.
#[derive(Debug, Clone, Copy)]
pub struct PresentedFrame<'a> {
    /// Slot the frame came from. Slots are laid out left to right by index.
    pub slot_id: SlotId,
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Packed 3-byte pixels, row-major, `width * 3` bytes per row
    pub rgb: &'a [u8],
}

/// Consumer of decoded frames.
///
/// `present` runs on the render loop task and should return quickly; a
/// renderer that needs to keep the pixels past the call must copy them.
pub trait Renderer: Send {
    fn present(&mut self, frame: PresentedFrame<'_>);

    /// The slot's producer went away; whatever was shown for it is stale.
    fn vacate(&mut self, _slot_id: SlotId) {}
}

impl<R: Renderer + ?Sized> Renderer for Box<R> {
    fn present(&mut self, frame: PresentedFrame<'_>) {
        (**self).present(frame)
    }

    fn vacate(&mut self, slot_id: SlotId) {
        (**self).vacate(slot_id)
    }
}

/// Present every new frame until `shutdown` flips (or its sender is dropped).
///
/// Returns the renderer so callers can inspect or flush it.
pub async fn run_render_loop<R: Renderer>(
    table: Arc<SlotTable>,
    mut renderer: R,
    mut shutdown: watch::Receiver<bool>,
) -> R {
    let mut changes = table.subscribe();
    let mut presented: Vec<Option<u64>> = vec![None; table.capacity()];
    info!(slots = presented.len(), "render loop started");

    while !*shutdown.borrow() {
        changes.borrow_and_update();

        for slot in table.snapshot() {
            let frame = slot.occupant.as_ref().and_then(|o| o.frame.as_ref());
            let last = &mut presented[slot.slot_id];
            match frame {
                Some(frame) if *last != Some(frame.sequence) => {
                    renderer.present(PresentedFrame {
                        slot_id: slot.slot_id,
                        sequence: frame.sequence,
                        width: frame.width,
                        height: frame.height,
                        rgb: &frame.rgb,
                    });
                    *last = Some(frame.sequence);
                }
                None if last.is_some() => {
                    debug!(slot = slot.slot_id, "slot vacated");
                    renderer.vacate(slot.slot_id);
                    *last = None;
                }
                _ => {}
            }
        }

        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!("render loop stopped");
    renderer
}

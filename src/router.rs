//! Automatic event routing.
//!
//! When a write token closes, the pre-image of the record's observed
//! projection is diffed against the post-image; any on-change route whose
//! observed fields differ emits a derived event built from its copy-out
//! plans. On-add fires after an inserted record is published, on-remove fires
//! before physical removal. Emissions are staged per storage and submitted at
//! the step boundary, so derived events become visible to readers no earlier
//! than the next step.

use crate::error::LayoutError;
use crate::layout::RecordLayout;
use crate::record::{ObservedImage, RecordBuf};
use crate::reflection::CopyOut;
use crate::storage::EventStorage;
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::trace;

/// Compiled (source slot, target slot) pairs of one copy-out list.
pub(crate) struct CopyOutPlan {
    pairs: SmallVec<[(u16, u16); 4]>,
}

impl CopyOutPlan {
    pub(crate) fn compile(
        trigger: &RecordLayout,
        event: &RecordLayout,
        list: &[CopyOut],
    ) -> Result<CopyOutPlan, LayoutError> {
        let mut pairs = SmallVec::new();
        for copy_out in list {
            let source = trigger.resolve_path(&copy_out.source).ok_or_else(|| {
                LayoutError::UnresolvedCopyOut {
                    record: trigger.type_name,
                    event: event.type_name,
                    path: format!("{}", copy_out.source),
                }
            })?;
            let target = event.resolve_path(&copy_out.target).ok_or_else(|| {
                LayoutError::UnresolvedCopyOut {
                    record: trigger.type_name,
                    event: event.type_name,
                    path: format!("{}", copy_out.target),
                }
            })?;
            if trigger.slot(source).kind != event.slot(target).kind {
                return Err(LayoutError::CopyOutKindMismatch {
                    record: trigger.type_name,
                    event: event.type_name,
                    copy_source: format!("{}", copy_out.source),
                    target: format!("{}", copy_out.target),
                });
            }
            pairs.push((source, target));
        }
        Ok(CopyOutPlan { pairs })
    }

    fn apply(&self, source: &RecordBuf, target: &mut RecordBuf) {
        for &(from, to) in &self.pairs {
            target.set_slot(to, source.slot(from).clone());
        }
    }

    fn apply_image(&self, layout: &RecordLayout, image: &ObservedImage, target: &mut RecordBuf) {
        for &(from, to) in &self.pairs {
            if let Some(value) = image.value_of(layout, from) {
                target.set_slot(to, value.clone());
            }
        }
    }

    pub(crate) fn sources(&self) -> impl Iterator<Item = u16> + '_ {
        self.pairs.iter().map(|&(from, _)| from)
    }
}

pub(crate) struct OnAddRoute {
    pub target: Arc<EventStorage>,
    pub plan: CopyOutPlan,
}

pub(crate) struct OnRemoveRoute {
    pub target: Arc<EventStorage>,
    pub plan: CopyOutPlan,
}

pub(crate) struct OnChangeRoute {
    pub target: Arc<EventStorage>,
    /// Slots whose change triggers this route.
    pub observed: SmallVec<[u16; 8]>,
    /// Evaluated against the pre-image.
    pub unchanged: CopyOutPlan,
    /// Evaluated against the post-image.
    pub changed: CopyOutPlan,
}

/// All automatic event routes triggered by one storage's records.
#[derive(Default)]
pub(crate) struct RouteSet {
    pub on_add: Vec<OnAddRoute>,
    pub on_change: Vec<OnChangeRoute>,
    pub on_remove: Vec<OnRemoveRoute>,
}

impl RouteSet {
    pub(crate) fn observes_changes(&self) -> bool {
        !self.on_change.is_empty()
    }
}

/// Events staged during a step, submitted at the boundary in emission order.
#[derive(Default)]
pub(crate) struct PendingEvents {
    staged: Vec<(Arc<EventStorage>, RecordBuf)>,
}

impl PendingEvents {
    pub(crate) fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    pub(crate) fn submit_all(&mut self) {
        for (target, event) in self.staged.drain(..) {
            target.submit(event);
        }
    }
}

/// Stages on-change events for every route whose observed fields differ
/// between the pre-image and the record's current state.
pub(crate) fn stage_on_change(
    routes: &RouteSet,
    pre: &ObservedImage,
    post: &RecordBuf,
    pending: &mut PendingEvents,
) {
    for route in &routes.on_change {
        let changed = route.observed.iter().any(|&slot| {
            pre.value_of(post.layout(), slot)
                .map(|old| *old != *post.slot(slot))
                .unwrap_or(true)
        });
        if !changed {
            continue;
        }
        let mut event = RecordBuf::new(route.target.layout.clone());
        route.unchanged.apply_image(post.layout(), pre, &mut event);
        route.changed.apply(post, &mut event);
        trace!(
            trigger = %post.type_name(),
            event = %route.target.layout.type_name,
            "staged on-change event"
        );
        pending.staged.push((route.target.clone(), event));
    }
}

/// Emits on-add events for a freshly published record. Runs at the step
/// boundary, after the record became visible.
pub(crate) fn emit_on_add(routes: &RouteSet, record: &RecordBuf) {
    for route in &routes.on_add {
        let mut event = RecordBuf::new(route.target.layout.clone());
        route.plan.apply(record, &mut event);
        route.target.submit(event);
    }
}

/// Emits on-remove events from the final state of a record about to be
/// removed. Runs at the step boundary, before physical removal.
pub(crate) fn emit_on_remove(routes: &RouteSet, record: &RecordBuf) {
    for route in &routes.on_remove {
        let mut event = RecordBuf::new(route.target.layout.clone());
        route.plan.apply(record, &mut event);
        route.target.submit(event);
    }
}

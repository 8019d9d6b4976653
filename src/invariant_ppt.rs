//! PPT invariant system: control-path invariant enforcement with contract tracking.
//!
//! Only the control context calls into this module. The audio context signals
//! through [`crate::invariant_rt`] instead, because this log takes a lock.

#[cfg(feature = "ppt")]
use lazy_static::lazy_static;
#[cfg(feature = "ppt")]
use std::collections::BTreeSet;
#[cfg(feature = "ppt")]
use std::sync::{Mutex, MutexGuard};

/// Engine configuration passed validation.
pub const INGRESS_VALIDATION: u32 = 1;
/// An edge was accepted and the graph stayed well-formed.
pub const GRAPH_LEGALITY: u32 = 2;
/// Validation rejected a structurally invalid graph.
pub const GRAPH_REJECTS_INVALID: u32 = 3;
/// A computed order respects every non-feedback edge.
pub const TOPO_ORDER_SOUND: u32 = 4;
/// A plan holds exactly one step per node and one slot per output port.
pub const PLAN_SOUNDNESS: u32 = 5;
/// A patch went through parse and validation before being handed out.
pub const PATCH_PIPELINE: u32 = 6;
/// A runtime was built on the control thread before publication.
pub const SWAP_BUILT_OFF_RT: u32 = 7;
/// A superseded runtime was freed on the control thread.
pub const RETIRED_OFF_RT: u32 = 8;

/// Name of a control-path invariant, for panics and contract reports.
pub const fn ppt_name(id: u32) -> &'static str {
    match id {
        INGRESS_VALIDATION => "INGRESS_VALIDATION",
        GRAPH_LEGALITY => "GRAPH_LEGALITY",
        GRAPH_REJECTS_INVALID => "GRAPH_REJECTS_INVALID",
        TOPO_ORDER_SOUND => "TOPO_ORDER_SOUND",
        PLAN_SOUNDNESS => "PLAN_SOUNDNESS",
        PATCH_PIPELINE => "PATCH_PIPELINE",
        SWAP_BUILT_OFF_RT => "SWAP_BUILT_OFF_RT",
        RETIRED_OFF_RT => "RETIRED_OFF_RT",
        _ => "UNKNOWN",
    }
}

#[cfg(feature = "ppt")]
lazy_static! {
    static ref ENFORCED: Mutex<BTreeSet<u32>> = Mutex::new(BTreeSet::new());
}

#[cfg(feature = "ppt")]
fn enforced() -> MutexGuard<'static, BTreeSet<u32>> {
    ENFORCED.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn failure(id: u32, message: &str, context: Option<&str>) -> String {
    match context {
        Some(ctx) => format!("{} violated: {} ({})", ppt_name(id), message, ctx),
        None => format!("{} violated: {}", ppt_name(id), message),
    }
}

/// Check `condition`, record `id` as enforced, and panic with `message` if it fails.
#[cfg(feature = "ppt")]
pub(crate) fn assert_invariant(id: u32, condition: bool, message: &str, context: Option<&str>) {
    enforced().insert(id);
    if !condition {
        let text = failure(id, message, context);
        tracing::error!(invariant = ppt_name(id), "{}", text);
        panic!("{}", text);
    }
}

/// Check `condition` and panic with `message` if it fails.
#[cfg(not(feature = "ppt"))]
pub(crate) fn assert_invariant(id: u32, condition: bool, message: &str, context: Option<&str>) {
    if !condition {
        panic!("{}", failure(id, message, context));
    }
}

/// Panic unless every invariant in `required` was asserted since the last
/// [`clear_invariant_log`].
#[cfg(feature = "ppt")]
pub fn contract_test(test_name: &str, required: &[u32]) {
    let missing: Vec<&'static str> = {
        let log = enforced();
        required
            .iter()
            .filter(|id| !log.contains(id))
            .map(|&id| ppt_name(id))
            .collect()
    };
    assert!(
        missing.is_empty(),
        "contract `{}` broken, never enforced: {}",
        test_name,
        missing.join(", ")
    );
}

/// No-op without the `ppt` feature.
#[cfg(not(feature = "ppt"))]
pub fn contract_test(_test_name: &str, _required: &[u32]) {}

/// Forget every recorded invariant.
#[cfg(feature = "ppt")]
pub fn clear_invariant_log() {
    enforced().clear();
}

/// No-op without the `ppt` feature.
#[cfg(not(feature = "ppt"))]
pub fn clear_invariant_log() {}

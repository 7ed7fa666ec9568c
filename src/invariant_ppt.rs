//! Runtime invariants of the build pipeline.
//!
//! The orchestrator asserts these while it runs. Tests then call [`contract_test`]
//! to prove the rules were actually evaluated on the path they exercised.

use std::collections::HashSet;
use std::sync::Mutex;
use lazy_static::lazy_static;
use log::error;

/// A successful result must point at an artifact that is on disk.
pub const SUCCESS_MEANS_ARTIFACT: &str = "Reported success requires the artifact on disk";
/// The previous artifact must be gone before the packaging tool runs.
pub const NO_STALE_ARTIFACT: &str = "No stale artifact may survive into the packaging step";
/// Nothing is installed or built until an interpreter has been found.
pub const PROBE_BEFORE_SIDE_EFFECTS: &str = "Toolchain must be confirmed before any side effect";

lazy_static! {
    static ref CHECKED_INVARIANTS: Mutex<HashSet<&'static str>> = Mutex::new(HashSet::new());
}

/// Asserts a pipeline invariant.
///
/// A violation panics in debug and test builds. Release builds log it and carry on,
/// because the final artifact check still decides the reported outcome.
pub fn assert_invariant(condition: bool, invariant: &'static str, stage: &str) {
    if !condition {
        let msg = format!("INVARIANT VIOLATION [{stage}]: {invariant}");
        error!("{}", msg);
        if cfg!(debug_assertions) || cfg!(test) {
            panic!("{}", msg);
        }
        return;
    }

    if let Ok(mut set) = CHECKED_INVARIANTS.lock() {
        set.insert(invariant);
    }
}

/// Panics unless every invariant in `required` has been asserted at least once.
#[cfg(test)]
pub fn contract_test(context: &str, required: &[&'static str]) {
    let checked = CHECKED_INVARIANTS.lock().unwrap();
    let missing: Vec<&str> = required.iter().copied().filter(|r| !checked.contains(r)).collect();

    assert!(
        missing.is_empty(),
        "Contract '{context}' failed. Never checked:\n{missing:#?}"
    );
    log::info!("Contract satisfied: {}", context);
}

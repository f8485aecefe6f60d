//! Managed-stack walker (named out of scope in §1; this is the
//! narrow trait `Buffer::write_event` calls).

/// Supplies an ordered list of instruction pointers for the current
/// thread's managed stack. The real walker lives in the runtime this
/// pipeline is embedded in; this crate only defines the seam.
pub trait StackWalker: Send + Sync {
    fn walk_current_thread(&self) -> Vec<u64>;
}

/// Stack walker that never has frames to report. Used whenever no
/// walker is configured; events with `need_stack` set still get a
/// (empty) stack record rather than a missing one.
pub struct NullStackWalker;

impl StackWalker for NullStackWalker {
    fn walk_current_thread(&self) -> Vec<u64> {
        Vec::new()
    }
}

/// Test double: returns a fixed frame list every time, so stack-id
/// de-duplication (§8 property 6) can be exercised deterministically.
#[cfg(any(test, feature = "test-util"))]
pub struct FixedStackWalker(pub Vec<u64>);

#[cfg(any(test, feature = "test-util"))]
impl StackWalker for FixedStackWalker {
    fn walk_current_thread(&self) -> Vec<u64> {
        self.0.clone()
    }
}

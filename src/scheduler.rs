//! Cooperative round-robin scheduling (§4.8), implemented as an
//! explicit `tick()` whose context-switch decision is a pure function
//! of `(now, thread_activation, thread_slice, status)` so it can be
//! exercised in tests without a real clock (§9, §10.4).

use crate::error::ScriptHandle;
use crate::registry::ScriptRegistry;

/// Whether the VM is multiplexing every runnable script, or has
/// temporarily pinned itself to one thread for a host-initiated
/// synchronous call (§4.7).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ThreadingMode {
    Multiple,
    Single(ScriptHandle),
}

/// Decides whether the scheduler should move off the current thread
/// before running its next instruction: either its slice has elapsed
/// or it has stopped being runnable. A `None` slice means "never
/// preempt" (the `Infinite` case from the reference priority model).
pub fn slice_elapsed(now_ms: u64, thread_activation_ms: u64, slice_ms: Option<u32>) -> bool {
    match slice_ms {
        None => false,
        Some(slice) => now_ms > thread_activation_ms + slice as u64,
    }
}

/// Decides whether a paused thread should wake: `true` once `now`
/// reaches the thread's `pause_end`.
pub fn pause_elapsed(now_ms: u64, pause_end_ms: u64) -> bool {
    now_ms >= pause_end_ms
}

/// Drives the round-robin context-switch decision over `candidates`
/// (loaded+executing handles in slot order), advancing past
/// `current` to the next one that is runnable. Returns `None` if
/// there is no runnable candidate at all.
pub fn next_thread(candidates: &[ScriptHandle], current: Option<ScriptHandle>) -> Option<ScriptHandle> {
    if candidates.is_empty() {
        return None;
    }
    match current.and_then(|c| candidates.iter().position(|&h| h == c)) {
        Some(index) => Some(candidates[(index + 1) % candidates.len()]),
        None => Some(candidates[0]),
    }
}

/// One outcome of advancing the scheduler by a single instruction.
#[derive(Debug)]
pub enum TickOutcome {
    /// An instruction ran on the returned thread.
    Ran(ScriptHandle),
    /// `Ret` unwound a stack-base marker; single-thread mode ends.
    SingleThreadExited,
    /// Nothing is runnable.
    Idle,
}

/// Holds the scheduler's cross-tick state: threading mode, which
/// thread is current, and when it was last activated. Per-script
/// pause/slice bookkeeping lives on [`crate::script::ScriptState`]
/// instead, since it must survive a script being skipped over for
/// several ticks.
pub struct Scheduler {
    pub mode: ThreadingMode,
    pub current_thread: Option<ScriptHandle>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler { mode: ThreadingMode::Multiple, current_thread: None }
    }

    /// Makes `handle` current and, per §4.8 step 3, stamps its
    /// `thread_activation_ms` to `now` so its per-priority time slice
    /// (§4.4) is measured from this switch rather than from whenever
    /// it last ran.
    fn switch_to(&mut self, handle: Option<ScriptHandle>, registry: &mut ScriptRegistry, now_ms: u64) {
        self.current_thread = handle;
        if let Some(handle) = handle {
            if let Some(script) = registry.get_mut(handle) {
                script.state.thread_activation_ms = now_ms;
            }
        }
    }

    /// Picks which thread should run next, applying the context
    /// switch and pause rules of §4.8 steps 3–4. Returns `None` if no
    /// thread should run this tick (either nothing is runnable, or
    /// the current thread is still paused).
    pub fn select(&mut self, registry: &mut ScriptRegistry, now_ms: u64) -> Option<ScriptHandle> {
        match self.mode {
            ThreadingMode::Single(handle) => {
                let script = registry.get(handle)?;
                if script.state.paused {
                    if pause_elapsed(now_ms, script.state.pause_end_ms) {
                        // Caller clears `paused`; we just fall through.
                        Some(handle)
                    } else {
                        None
                    }
                } else {
                    Some(handle)
                }
            }
            ThreadingMode::Multiple => {
                let candidates = registry.runnable_handles();
                if candidates.is_empty() {
                    return None;
                }
                let needs_switch = match self.current_thread.and_then(|h| registry.get(h)) {
                    None => true,
                    Some(script) => {
                        !script.state.executing
                            || slice_elapsed(
                                now_ms,
                                script.state.thread_activation_ms,
                                Some(script.time_slice.milliseconds),
                            )
                    }
                };
                if needs_switch {
                    self.switch_to(next_thread(&candidates, self.current_thread), registry, now_ms);
                }
                // A paused thread hands off immediately rather than
                // idling the whole scheduler until its own wake time:
                // walk the round-robin forward until a runnable,
                // unpaused candidate is found, or every candidate is
                // paused.
                for _ in 0..candidates.len() {
                    let handle = self.current_thread?;
                    let script = registry.get(handle)?;
                    if script.state.paused && !pause_elapsed(now_ms, script.state.pause_end_ms) {
                        self.switch_to(next_thread(&candidates, self.current_thread), registry, now_ms);
                        continue;
                    }
                    return Some(handle);
                }
                None
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Scheduler {
        Scheduler::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_elapsed_is_false_for_infinite_priority() {
        assert!(!slice_elapsed(10_000, 0, None));
    }

    #[test]
    fn slice_elapsed_true_once_past_activation_plus_slice() {
        assert!(!slice_elapsed(100, 0, Some(120)));
        assert!(slice_elapsed(121, 0, Some(120)));
    }

    #[test]
    fn pause_elapsed_at_exact_wake_time() {
        assert!(pause_elapsed(50, 50));
        assert!(!pause_elapsed(49, 50));
    }

    #[test]
    fn next_thread_round_robins_and_wraps() {
        let candidates = vec![1, 2, 3];
        assert_eq!(next_thread(&candidates, None), Some(1));
        assert_eq!(next_thread(&candidates, Some(1)), Some(2));
        assert_eq!(next_thread(&candidates, Some(3)), Some(1));
    }

    #[test]
    fn next_thread_with_no_candidates_is_none() {
        assert_eq!(next_thread(&[], Some(1)), None);
    }
}

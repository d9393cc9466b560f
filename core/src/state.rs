//! Plumbing shared by the lifecycle state machines.
//!
//! Every resource keeps its state in a [`watch`] channel: transitions are compare-and-set
//! updates on the sender, and suspended operations park on a receiver until the state they
//! wait for (or a release) shows up.

use tokio::sync::watch;

/// Moves `state` to `to` if it currently is one of `from`.
///
/// Returns the previous state on success, or the current state when it was not in `from`.
pub(crate) fn transition<S>(state: &watch::Sender<S>, from: &[S], to: S) -> Result<S, S>
where
    S: Copy + PartialEq,
{
    let mut outcome = Err(to);

    state.send_if_modified(|current| {
        let previous = *current;
        if !from.contains(&previous) {
            outcome = Err(previous);
            return false;
        }

        *current = to;
        outcome = Ok(previous);

        previous != to
    });

    outcome
}

/// Resolves with the first state satisfying `predicate`, the current one included.
pub(crate) async fn wait_until<S, F>(mut state: watch::Receiver<S>, mut predicate: F) -> S
where
    S: Copy,
    F: FnMut(&S) -> bool,
{
    let reached = state.wait_for(|s| predicate(s)).await.map(|s| *s);

    // The sender lives as long as the resource, so a closed channel only happens on teardown.
    reached.unwrap_or_else(|_| *state.borrow())
}

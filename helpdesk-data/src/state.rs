//! Small reducer containers for process-wide client state.

use std::fmt::Debug;

use tokio::sync::watch;
use tracing::trace;

/// A pure state transition: `reduce(state, action)` yields the next state.
pub trait Reducer {
    type State: Clone + Debug + PartialEq + Send + Sync + 'static;
    type Action: Debug;

    fn reduce(state: &Self::State, action: Self::Action) -> Self::State;
}

/// Holds one reducer's state and publishes every change.
///
/// Instances are injected where needed; there is no global store.
pub struct StateStore<R: Reducer> {
    tx: watch::Sender<R::State>,
}

impl<R: Reducer> StateStore<R> {
    pub fn new(initial: R::State) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Apply `action`. Observers are woken only if the state changed.
    pub fn dispatch(&self, action: R::Action) -> R::State {
        trace!(?action, "dispatch");
        self.tx.send_if_modified(|state| {
            let reduced = R::reduce(state, action);
            if reduced == *state {
                return false;
            }
            *state = reduced;
            true
        });
        self.get()
    }

    pub fn get(&self) -> R::State {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<R::State> {
        self.tx.subscribe()
    }
}

impl<R: Reducer> Default for StateStore<R>
where
    R::State: Default,
{
    fn default() -> Self {
        Self::new(R::State::default())
    }
}

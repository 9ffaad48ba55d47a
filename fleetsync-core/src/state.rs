//! State containers.
//!
//! The retry executor stashes the latest successful read into whatever
//! response object the host handed the operation. Each host response shape
//! implements [`StateContainer`] so the executor never needs to know which
//! one it holds.

use crate::diagnostics::Diagnostics;

/// Uniform get/set facade over an operation's response object.
pub trait StateContainer {
    type State;

    fn get(&self) -> Option<&Self::State>;

    fn set(&mut self, state: Self::State);
}

impl<C: StateContainer + ?Sized> StateContainer for &mut C {
    type State = C::State;

    fn get(&self) -> Option<&Self::State> {
        (**self).get()
    }

    fn set(&mut self, state: Self::State) {
        (**self).set(state);
    }
}

/// Bare container holding at most one state value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSlot<S> {
    state: Option<S>,
}

impl<S> StateSlot<S> {
    pub fn new() -> Self {
        Self { state: None }
    }

    pub fn with_state(state: S) -> Self {
        Self { state: Some(state) }
    }

    pub fn take(&mut self) -> Option<S> {
        self.state.take()
    }

    pub fn into_inner(self) -> Option<S> {
        self.state
    }
}

impl<S> Default for StateSlot<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> StateContainer for StateSlot<S> {
    type State = S;

    fn get(&self) -> Option<&S> {
        self.state.as_ref()
    }

    fn set(&mut self, state: S) {
        self.state = Some(state);
    }
}

macro_rules! host_response {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq)]
        pub struct $name<S> {
            pub state: Option<S>,
            pub diagnostics: Diagnostics,
        }

        impl<S> $name<S> {
            pub fn new() -> Self {
                Self {
                    state: None,
                    diagnostics: Diagnostics::new(),
                }
            }

            /// Response seeded with the state the host already knows.
            pub fn with_state(state: S) -> Self {
                Self {
                    state: Some(state),
                    diagnostics: Diagnostics::new(),
                }
            }
        }

        impl<S> Default for $name<S> {
            fn default() -> Self {
                Self::new()
            }
        }

        impl<S> StateContainer for $name<S> {
            type State = S;

            fn get(&self) -> Option<&S> {
                self.state.as_ref()
            }

            fn set(&mut self, state: S) {
                self.state = Some(state);
            }
        }
    };
}

host_response!(
    /// Host response for a create operation.
    CreateResponse
);
host_response!(
    /// Host response for a read (refresh) operation.
    ReadResponse
);
host_response!(
    /// Host response for an update operation.
    UpdateResponse
);

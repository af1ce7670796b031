//! Actor framework for the node agent.
//!
//! Long-lived components that own mutable state (the fetcher pool) run as
//! actors: one task, one mailbox, messages handled one at a time. The
//! [`Supervisor`] owns them and stops them together on shutdown.

mod framework;

pub use framework::{
    Actor, ActorContext, ActorError, ActorHandle, ActorRef, ActorState, Message, Supervisor,
};

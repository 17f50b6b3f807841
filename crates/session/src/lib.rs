//! Interactive segmentation session.
//!
//! [`session::Session`] wires the annotation store, the viewport and the
//! render tree ([`orchestrator`]) to the inference channel and to an
//! [`AnnotationPersistence`](segmark_persistence::AnnotationPersistence)
//! backend.

pub mod config;
pub mod debounce;
pub mod error;
pub mod orchestrator;
pub mod registry;
pub mod render;
pub mod session;
pub mod writer;

pub use config::SessionConfig;
pub use error::SessionError;
pub use session::{Session, SessionCommand, SessionHandle, Snapshot};

//! Kina Backend - adapter over the VM-per-container virtualization backend.
//!
//! Every backend unit is a dedicated lightweight VM with its own kernel and
//! network identity. This crate exposes a narrow capability set over that
//! backend ([`VmBackend`]) plus the production implementation that drives
//! the Apple Container CLI as a subprocess ([`ContainerCli`]).
//!
//! The trait is the single seam for mocking: everything above it (lifecycle
//! managers, CRI services) is tested against [`mock::MockBackend`].

pub mod adapter;
pub mod cli;
pub mod mock;
pub mod reference;

pub use adapter::{ExecOutput, ImageInfo, UnitSpec, UnitState, UnitStatus, UnitSummary, VmBackend};
pub use cli::ContainerCli;
pub use reference::ImageReference;

//! Core library that gets Lexis' bundled dictionary ready for use.
//!
//! The dictionary ships read-only inside the application package and has to
//! be copied into writable storage before SQLite can open it. The modules
//! split that job along clear lines:
//! - [`config`] holds the compiled asset constants and loadable settings.
//! - [`version`] reads and writes the `.version` sidecar marker.
//! - [`integrity`] decides whether a file is a plausible copy of the asset.
//! - [`locator`] resolves per-platform paths and the retrieval strategy.
//! - [`provision`] runs the single-flight `ensure_ready` state machine.
//! - [`db`] opens the provisioned dictionary for the rest of the app.
//! - [`errors`] and [`logging`] carry the error catalogue and event-coded diagnostics.

pub mod config;
pub mod db;
pub mod errors;
pub mod integrity;
pub mod locator;
pub mod logging;
pub mod provision;
pub mod version;

pub use errors::{ProvisionResult, ProvisioningError};
pub use provision::{ProvisionStatus, Provisioner, ProvisionerBuilder};

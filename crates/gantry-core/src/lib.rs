//! Gantry Core - backend lifecycle, dispatch, and gallery subsystem
//!
//! This crate is the heart of the Gantry inference gateway: it owns the
//! cache of live out-of-process model workers, the RPC contract they speak,
//! the watchdog that reaps them, and the installer that materializes models
//! from remote galleries.
//!
//! # Architecture
//!
//! - Every model worker is an external process on a loopback port speaking a
//!   newline-delimited JSON RPC.
//! - The loader keeps at most one live worker per configuration fingerprint
//!   and enforces the parallelism / single-active policies.
//! - HTTP handlers go through the dispatch facade, which renders prompts,
//!   applies per-request overrides, and filters stop sequences.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod gallery;
pub mod loader;
pub mod options;
pub mod process;
pub mod rpc;
pub mod startup;
pub mod templates;
pub mod watchdog;

pub use config::{BackendConfig, ConfigStore, GenerationDefaults, TemplateConfig};
pub use dispatch::{ChatOutcome, ChatStream, Dispatcher, GenerationOverrides};
pub use error::{Error, Result};
pub use gallery::{Gallery, GalleryInstaller, GalleryModel, InstallJob, JobProgress};
pub use loader::{BackendInstance, InstanceStatus, LoaderKey, ModelLoader};
pub use options::AppOptions;
pub use process::ProcessSupervisor;
pub use rpc::{PredictOptions, StreamEvent, TranscriptSegment, WorkerClient};
pub use startup::{startup, Application};
pub use templates::ChatMessage;
pub use watchdog::Watchdog;

//! Node Network Daemon
//!
//! Declarative network configuration for a single host. Every piece of
//! desired or observed network state is a typed resource in an in-memory
//! store; independent controllers reconcile between resources and the
//! kernel until the two agree.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  machine config · kernel cmdline · platform snapshot · operators        │
//! └──────────────────────────────┬──────────────────────────────────────────┘
//!                                │ config controllers
//!                    ┌───────────┴───────────┐
//!                    │  config namespace     │  {layer}/{id}
//!                    └───────────┬───────────┘
//!                                │ merge controllers
//!                    ┌───────────┴───────────┐
//!                    │  network namespace    │  final specs + statuses
//!                    └───────────┬───────────┘
//!                                │ spec controllers
//! ┌──────────────────────────────┴──────────────────────────────────────────┐
//! │  kernel adapters: links · addresses · routes · ethtool · nftables · host│
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`runtime`]: resource store, controller contract and engine
//! - [`resources`]: resource kinds and identifiers
//! - [`controllers`]: the reconciliation loops
//! - [`adapters`]: kernel ports, the Linux backend and the simulated kernel
//! - [`machine`]: machine configuration and kernel cmdline parsing
//! - [`dns`]: host DNS forwarder
//! - [`persist`]: state-volume files
//! - [`error`]: error types and handling

pub mod adapters;
pub mod controllers;
pub mod dns;
pub mod error;
pub mod machine;
pub mod metrics;
pub mod persist;
pub mod resources;
pub mod runtime;

pub use adapters::{HostInventory, Kernel, MemoryKernel};
#[cfg(target_os = "linux")]
pub use adapters::LinuxKernel;
pub use controllers::{register_all, ControllerDeps, KernelHandle};
pub use error::{Error, ErrorAction, Result};
pub use machine::{Cmdline, MachineConfig, MACHINE_CONFIG_ID};
pub use resources::{Kind, Namespace, NetworkStatus, NETWORK_STATUS_ID};
pub use runtime::{Controller, ControllerRuntime, Engine, RuntimeConfig, State};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

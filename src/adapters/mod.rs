//! Kernel Adapters
//!
//! Ports the controllers use to reach the kernel, the typed link settings
//! and rule compilers behind them, the Linux implementation of the ports on
//! top of netlink, and a simulated kernel implementing them for tests.

pub mod kernel;
pub mod link_data;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod memory;
pub mod nftables;
pub mod wireguard;

pub use kernel::{
    AddressBackend, EthtoolBackend, EthtoolLinkState, HostBackend, Kernel, KernelAddress,
    KernelEvent, KernelLink, KernelRoute, LinkBackend, LinkInfo, LinkRequest, NfTablesBackend,
    RouteBackend, WireguardBackend,
};
pub use link_data::LinkData;
#[cfg(target_os = "linux")]
pub use linux::LinuxKernel;
pub use memory::{HostInventory, InventoryLink, MemoryKernel};

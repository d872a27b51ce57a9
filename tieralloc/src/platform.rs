//! Platform specific code.

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::LinuxPlatform;

#[cfg(target_os = "linux")]
pub(crate) use linux::current_cpu;

#[cfg(target_os = "linux")]
pub(crate) use linux::set_preferred_node;

#[cfg(not(target_os = "linux"))]
compile_error!("tieralloc only supports Linux");

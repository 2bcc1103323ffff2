//! Shared MITM proxy supervision for independent editor instances on one host.
//!
//! Every instance runs a [`ProxyManager`]. The first one to bind the configured port owns the
//! proxy child; the rest point their proxy indirection at it and watch the port, taking over
//! when the owner disappears or leaves an orphan behind.

pub mod arbiter;
pub mod config;
pub mod error;
pub mod events;
pub mod idle;
pub mod inspect;
pub mod manager;
pub mod port;
pub mod state;
pub mod supervisor;
pub mod system_proxy;

#[cfg(all(test, unix))]
mod test_support;

pub use config::{InterceptorConfig, ProxyConfig, Timings};
pub use error::ProxyError;
pub use events::{EventBus, EventKind, ProxyEvent};
pub use inspect::{PlatformInspector, ProcessInspector};
pub use manager::{ProxyManager, ProxyManagerBuilder, TickOutcome};
pub use state::{OwnershipState, ProxyStatus};
pub use system_proxy::{MemoryProxySettings, SettingsFileProxy, SystemProxyConfigurator};

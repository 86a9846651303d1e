// IPC module - DNS proxy between sandboxed analyses and the shared resolver

pub mod bridge;
pub mod protocol;
pub mod resolver;
pub mod transport;

pub use bridge::{send_guarded, ChildChannel, DnsBridge};
pub use protocol::{
    parse_message, AddressFamily, ChildMessage, IpcRequest, IpcResponse, LookupAddress,
    LookupOptions, LookupResult, ResolveOptions, ResolvedRecord,
};
pub use resolver::{CachingResolver, DnsResolver};
pub use transport::{socket_pair, IpcEndpoint, CHILD_IPC_FD, IPC_FD_ENV};

//! FeedAuth Plugins - out-of-process credential plugin protocol
//!
//! This crate provides:
//! - Discovery of plugin executables from configured paths
//! - A newline-delimited JSON connection with handshake, faults and cancellation
//! - A shared process table with reference-counted leases and idle shutdown
//! - A plugin manager negotiating and caching operation claims

pub mod claims_cache;
pub mod connection;
pub mod discovery;
pub mod env;
pub mod error;
pub mod factory;
pub mod logging;
pub mod manager;
pub mod messages;
pub mod options;
#[cfg(any(test, feature = "test-utils"))]
pub mod testkit;

pub use claims_cache::ClaimsCacheStore;
pub use connection::{PluginConnection, RequestHandler, RequestHandlers};
pub use discovery::{
    AcceptAllVerifier, EmbeddedSignatureVerifier, PluginDiscoverer, PluginDiscoveryResult,
    PluginFile, PluginFileState,
};
pub use env::{EnvironmentReader, MapEnvironment, SystemEnvironment};
pub use error::{PluginError, Result};
pub use factory::{
    LaunchedPlugin, Plugin, PluginFactory, PluginLauncher, PluginLease, PluginUtilities,
    ProcessLauncher,
};
pub use logging::LogRequestHandler;
pub use manager::{PluginHandle, PluginManager, SharedPluginManager, SourceAgnosticPlugin};
pub use messages::{
    GetAuthenticationCredentialsRequest, GetAuthenticationCredentialsResponse, LogLevel, Message,
    MessageMethod, MessageResponseCode, MessageType, OperationClaim, ProtocolVersion,
    SetCredentialsRequest, SetLogLevelRequest,
};
pub use options::{ConnectionOptions, PluginFlavor, PluginManagerConfig};

//! Client half of the application-network hub.
//!
//! A [`Client`] owns one WebSocket [`connection::Connection`] and an
//! [`extension::ExtensionRegistry`] holding the standard extension plane:
//! typed pub/sub ([`event::EventRegistry`]), request/response endpoints
//! ([`endpoint::EndpointExtension`]), replicated tables
//! ([`table::TableExtension`]) and the value registry
//! ([`registry::RegistryExtension`]).

pub mod client;
pub mod connection;
pub mod endpoint;
pub mod event;
pub mod extension;
pub mod registry;
pub mod serializer;
pub mod table;

pub use client::{Client, ClientError};
pub use connection::{Connection, ConnectionListener, ConnectionStatus, TransportError};
pub use endpoint::{EndpointCallError, EndpointExtension, EndpointType};
pub use event::{EventRegistry, EventType, ListenerId};
pub use extension::{ExtensionError, ExtensionRegistry, ExtensionType};
pub use registry::RegistryExtension;
pub use serializer::{ArrayOf, CodecError, Json, MapOf, Noop, Serializer};
pub use table::{Keyable, Table, TableExtension, TableListener, TableType, model_table};

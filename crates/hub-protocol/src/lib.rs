// hub-protocol: Wire types for the application-network hub.
//
// Every WebSocket frame is a JSON `Envelope` with a `type` field naming the
// event and an opaque `data` payload.  The payload structs below define the
// shapes carried by the built-in and extension-provided events; extension
// event names follow `"<extension>:<local>"`.
//
// Object order matters on this wire: paginated fetch responses and the
// `items` maps of table mutations are ordered JSON objects, so all item maps
// are `IndexMap` and `serde_json` is built with `preserve_order`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A single message on the wire: `{"type": "<event-key>", "data": <json>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Network address of a hub server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub secure: bool,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            secure: false,
        }
    }

    /// WebSocket endpoint: `ws(s)://host:port/ws`.
    pub fn ws_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{scheme}://{}:{}/ws", self.host, self.port)
    }

    /// Legacy HTTP endpoint base: `http(s)://host:port/api/v1`.
    pub fn http_url(&self, endpoint: &str) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}:{}/api/v1/{endpoint}", self.host, self.port)
    }
}

/// Identity of a connected application.
///
/// Sent as the `connect` payload; the server rejects a second session whose
/// `key()` collides with a live one by closing the socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    pub name: String,
    pub group: String,
    pub version: String,
}

impl App {
    pub fn new(
        name: impl Into<String>,
        group: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
            version: version.into(),
        }
    }

    /// Stable identity within one server.
    pub fn key(&self) -> String {
        format!("{}/{}", self.group, self.name)
    }
}

// ---------------------------------------------------------------------------
// Endpoint descriptors and payloads
// ---------------------------------------------------------------------------

/// Descriptor of a request/response endpoint hosted by some app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    /// App key of the hosting application (or an extension key for built-ins).
    pub owner: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl EndpointInfo {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            description: None,
        }
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.owner, self.name)
    }
}

/// `endpoint:call` and `endpoint:receive` payload.
///
/// `key` correlates a call with its reply.  Callers allocate keys from a
/// per-client monotonic counter; the server re-keys calls it forwards
/// between sessions, so the value is only meaningful to whoever minted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointCall {
    #[serde(rename = "type")]
    pub endpoint: String,
    pub key: u64,
    pub data: Value,
}

/// `endpoint:error` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointError {
    #[serde(rename = "type")]
    pub endpoint: String,
    pub key: u64,
    pub error: String,
}

// ---------------------------------------------------------------------------
// Table descriptors and payloads
// ---------------------------------------------------------------------------

/// Descriptor of a replicated table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    /// Key of the owning extension.
    pub extension: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Back the table with the server's persistent store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_database: Option<bool>,
    /// Keep a bounded read-through cache in front of the persistent store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<bool>,
    /// Bound for the server-side cache, and the client's prime-fetch size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_size: Option<usize>,
}

impl TableInfo {
    pub fn new(extension: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
            name: name.into(),
            description: None,
            use_database: None,
            cache: None,
            cache_size: None,
        }
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.extension, self.name)
    }
}

/// Payload of the `table:item_add | item_update | item_remove` events.
///
/// `items` maps item key to the item's serialized form.  Order is preserved
/// end to end; the client cache replays it as insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableItems {
    #[serde(rename = "type")]
    pub table: String,
    pub items: IndexMap<String, Value>,
}

/// Payload of `table:item_clear`, `table:listen` and `table:proxy_listen`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableKey {
    #[serde(rename = "type")]
    pub table: String,
}

/// Request payload of the `table:item_get` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableKeys {
    #[serde(rename = "type")]
    pub table: String,
    pub items: Vec<String>,
}

/// Request payload of the `table:item_fetch` endpoint.
///
/// The cursor is exclusive: the returned page starts at the first key
/// *after* `cursor`.  A `None` cursor fetches the first page.  The server
/// answers with an empty page once the key space is exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableFetch {
    #[serde(rename = "type")]
    pub table: String,
    pub limit: usize,
    #[serde(default)]
    pub cursor: Option<String>,
}

/// `table:proxy` payload, both as the server-pushed event and as the
/// client's endpoint reply.  `key` is the server-chosen correlation id of
/// the in-flight proxy batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableProxy {
    #[serde(rename = "type")]
    pub table: String,
    pub key: u64,
    pub items: IndexMap<String, Value>,
}

// ---------------------------------------------------------------------------
// Registry payloads
// ---------------------------------------------------------------------------

/// `registry:update` payload.  `key` is `"<app-key>:<name>"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryUpdate {
    pub key: String,
    pub value: Value,
}

// ---------------------------------------------------------------------------
// Event keys
// ---------------------------------------------------------------------------

/// Built-in and extension-provided event keys.
pub mod event_keys {
    pub const CONNECT: &str = "connect";
    pub const READY: &str = "ready";

    pub const ENDPOINT_REGISTER: &str = "endpoint:register";
    pub const ENDPOINT_CALL: &str = "endpoint:call";
    pub const ENDPOINT_RECEIVE: &str = "endpoint:receive";
    pub const ENDPOINT_ERROR: &str = "endpoint:error";

    pub const TABLE_REGISTER: &str = "table:register";
    pub const TABLE_LISTEN: &str = "table:listen";
    pub const TABLE_PROXY_LISTEN: &str = "table:proxy_listen";
    pub const TABLE_PROXY: &str = "table:proxy";
    pub const TABLE_ITEM_ADD: &str = "table:item_add";
    pub const TABLE_ITEM_UPDATE: &str = "table:item_update";
    pub const TABLE_ITEM_REMOVE: &str = "table:item_remove";
    pub const TABLE_ITEM_CLEAR: &str = "table:item_clear";

    pub const REGISTRY_UPDATE: &str = "registry:update";
    pub const REGISTRY_LISTEN: &str = "registry:listen";
}

/// Endpoint keys served by the hub itself.
pub mod endpoint_keys {
    pub const TABLE_ITEM_GET: &str = "table:item_get";
    pub const TABLE_ITEM_FETCH: &str = "table:item_fetch";
    pub const TABLE_ITEM_SIZE: &str = "table:item_size";
    pub const TABLE_PROXY: &str = "table:proxy";
    pub const REGISTRY_GET: &str = "registry:get";
    pub const SERVER_SHUTDOWN: &str = "server:shutdown";
}

//! Workspace umbrella crate.
//!
//! The real code lives in the members: `hub-protocol` (wire types),
//! `hub-client` (the client extension plane), `hub-test-utils` (mock
//! broker) and `services/server` (the broker).  This package exists to
//! host the cross-crate end-to-end suites under `tests/integration/`,
//! which drive a real in-process server with real clients over loopback.

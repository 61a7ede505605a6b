// hub-test-utils: test doubles for hub clients.
//
// `MockBroker` is a minimal WebSocket peer speaking the envelope protocol:
// it accepts the `connect` handshake, records every inbound envelope, can
// push scripted envelopes to the connected client, and answers endpoint
// calls with configurable responders.

mod mock_broker;

pub use mock_broker::MockBroker;

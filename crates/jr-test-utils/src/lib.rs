// jr-test-utils: Shared test utilities for the relay node.
//
// Provides a scripted mock backend (WebSocket server speaking the uplink
// session protocol) and a framed TCP client for driving the ingress
// transport in integration tests.

pub mod framed_client;
pub mod mock_backend;

pub use framed_client::FramedClient;
pub use mock_backend::MockBackend;

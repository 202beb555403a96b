// cl-test-utils: Shared test utilities for the device gateway suite.
//
// Provides a mock device that speaks the device side of the wire protocol
// over an in-memory stream, plus RSA key fixtures, for integration testing
// of the gateway service.

pub mod keys;
pub mod mock_device;

pub use keys::{device_id, test_keypair};
pub use mock_device::MockDevice;

pub mod domain;
pub mod storage;
pub mod telemetry;

// Re-export mocks when testing feature is enabled
#[cfg(any(test, feature = "testing"))]
pub use domain::MockPendingRegistrationRepository;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockProfileRepository;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockRejectionNotifier;
#[cfg(any(test, feature = "testing"))]
pub use storage::MockKeyValueStore;

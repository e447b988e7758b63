pub mod apollo;
pub mod hubspot;
pub mod mock;
pub mod salesnav;

pub use apollo::ApolloPlatform;
pub use hubspot::HubSpotPlatform;
pub use mock::{FailureKind, MockPlatform};
pub use salesnav::SalesNavPlatform;

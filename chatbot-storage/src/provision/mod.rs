//! Collection provisioning
//!
//! Adapters never open collections themselves. They declare a
//! [`CollectionDescriptor`] and go through a [`ProvisionedCollection`], which
//! resolves the collection once, reconciles its indexes, seeds fixtures and
//! hands out [`MonitoredCollection`] handles whose network failures feed the
//! process-wide [`HealthMonitor`](crate::health::HealthMonitor).
//!
//! The [`Dialect`] captures what differs between backends.

mod collection;
mod descriptor;
mod dialect;
mod monitored;

pub use collection::{Access, ProvisionedCollection};
pub use descriptor::CollectionDescriptor;
pub use dialect::{Dialect, RESTRICTED_PAGE_CAP};
pub use monitored::MonitoredCollection;

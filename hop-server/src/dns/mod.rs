//! DNS provider credentials for DNS-01 challenges.

mod credentials;
mod registry;

pub use credentials::{CloudflareAuth, Credentials};
pub use registry::{DnsProvider, DnsProviderRegistry, RegistryError};

//! Service configuration.
//!
//! Settings are looked up in three layers: the remote settings service, the
//! process environment, and a static file loaded once at startup.
//! [`ConfigurationProvider`] owns all three and keeps the remote layer fresh.

pub mod provider;
pub mod service;
pub mod settings;
pub mod sources;

pub use provider::{
    ConfigurationProvider, DirectSettingsSource, ProviderOptions, ProviderState, SettingsRequest,
    SettingsSource,
};
pub use settings::{BrokerSettings, DataType, SettingItem, keys};

#[cfg(test)]
mod tests;

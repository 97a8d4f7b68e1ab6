mod settings;

use config::{Config, Environment, File};

use crate::utils::error::Result;

pub use settings::{
    BrokerSettings, LoggingSettings, MaintenanceSettings, PartialSettings, PersistenceSettings,
    ServerSettings, Settings,
};

/// Loads the configuration from `config/default.*` and `AGENTBUS__*`
/// environment variables, merges it over the defaults and validates it.
pub fn load_config() -> Result<Settings> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("AGENTBUS")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    let settings = Settings::from_partial(partial);
    settings.validate()?;
    Ok(settings)
}

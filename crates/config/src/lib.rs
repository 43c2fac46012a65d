//! Configuration for the Zalo relay: `zalo-relay.toml` plus environment
//! overrides.

pub mod loader;
pub mod schema;

pub use {
    loader::{
        APP_NAME, CONFIG_FILE_NAME, apply_env_overrides, config_dir, find_config_file,
        load_config, load_config_file,
    },
    schema::{
        CredentialsConfig, LoginConfig, ProxiesConfig, RelayConfig, ReloginConfig,
        SidecarSection, WebhooksConfig,
    },
};

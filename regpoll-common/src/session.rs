use zenoh::Session;

use crate::config::ZenohConfig;
use crate::error::{Error, Result};

/// Open a Zenoh session for snapshot publishing.
pub async fn connect(config: &ZenohConfig) -> Result<Session> {
    let zenoh_config = build_zenoh_config(config)?;

    tracing::info!(
        mode = %config.mode,
        connect = ?config.connect,
        listen = ?config.listen,
        "Opening Zenoh session"
    );

    let session = zenoh::open(zenoh_config).await?;

    tracing::info!(zid = %session.zid(), "Zenoh session open");

    Ok(session)
}

/// Translate [`ZenohConfig`] into a native Zenoh configuration.
pub fn build_zenoh_config(config: &ZenohConfig) -> Result<zenoh::Config> {
    let mut zenoh_config = zenoh::Config::default();

    let mode = match config.mode.as_str() {
        "client" | "peer" | "router" => format!("\"{}\"", config.mode),
        other => {
            return Err(Error::ZenohConfig(format!(
                "Invalid Zenoh mode: '{}'. Expected 'client', 'peer', or 'router'",
                other
            )));
        }
    };

    zenoh_config
        .insert_json5("mode", &mode)
        .map_err(|e| Error::ZenohConfig(format!("Failed to set mode: {}", e)))?;

    for (key, endpoints) in [
        ("connect/endpoints", &config.connect),
        ("listen/endpoints", &config.listen),
    ] {
        if endpoints.is_empty() {
            continue;
        }
        let json = serde_json::to_string(endpoints)
            .map_err(|e| Error::ZenohConfig(format!("Invalid {}: {}", key, e)))?;
        zenoh_config
            .insert_json5(key, &json)
            .map_err(|e| Error::ZenohConfig(format!("Failed to set {}: {}", key, e)))?;
    }

    Ok(zenoh_config)
}

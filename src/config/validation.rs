//! Configuration validation.

use crate::config::Config;

/// Validate the configuration.
///
/// Checks for:
/// - A known log level
/// - A non-zero port when serving is required
/// - A bind address that matches the bind network
///
/// # Returns
///
/// `Ok(())` if valid, or an error message describing every problem found.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    // Validate log level
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            valid_levels.join(", ")
        ));
    }

    let serving = &config.serving;

    if serving.required && serving.bind_port == 0 {
        errors.push(
            "bind_port must be between 1 and 65535 when serving is required, it cannot be turned off with 0"
                .to_string(),
        );
    }

    if serving.bind_port != 0 && !serving.bind_network.accepts(&serving.bind_address) {
        errors.push(format!(
            "bind_network '{}' cannot listen on bind_address {}",
            serving.bind_network, serving.bind_address
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

//! State tree synchronization
//!
//! Keeps the objects under `gpio.` in line with the configuration: every
//! configured pin gets exactly the states its role needs, everything else
//! is removed. Safe to run repeatedly.

use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::config::{AdapterConfig, PortConfig, PortRole};
use crate::constants::states::{self, roles};
use crate::paths::{channel_id, namespace_prefix, parse_path, state_id};
use crate::store::{ObjectDescriptor, StateStore, ValueType};
use pb_error::Result;

/// Bring the objects of one pin in line with its configuration.
///
/// `None` or a disabled role removes the whole channel.
pub async fn sync_port(store: &dyn StateStore, pin: u32, port: Option<&PortConfig>) -> Result<()> {
    let role = port.map(|p| p.role).unwrap_or(PortRole::Disabled);

    if role == PortRole::Disabled {
        debug!(pin, "Removing channel of disabled GPIO");
        return store.delete_object(&channel_id(pin), true).await;
    }

    let name = port
        .map(PortConfig::display_name)
        .unwrap_or_else(|| format!("GPIO {}", pin));
    store
        .ensure_object(&channel_id(pin), ObjectDescriptor::channel(name.as_str(), roles::CHANNEL))
        .await?;

    let is_input = role.is_input();
    let state_path = state_id(pin, states::STATE);
    if role.is_gpio() {
        let role_name = if is_input { roles::INDICATOR } else { roles::SWITCH };
        store
            .ensure_object(
                &state_path,
                ObjectDescriptor::state(name.as_str(), role_name, ValueType::Boolean, is_input, !is_input),
            )
            .await?;
    } else if !role.is_button() {
        store.delete_object(&state_path, false).await?;
    }

    for event in states::BUTTON_EVENTS {
        let path = state_id(pin, event);
        if role.is_button() {
            store
                .ensure_object(
                    &path,
                    ObjectDescriptor::state(
                        format!("{} {}", name, event),
                        roles::BUTTON,
                        ValueType::Boolean,
                        false,
                        true,
                    ),
                )
                .await?;
        } else if *event != states::STATE {
            store.delete_object(&path, false).await?;
        }
    }

    for event in states::LEGACY_BUTTON_EVENTS {
        store.delete_object(&state_id(pin, event), false).await?;
    }

    let is_input_path = state_id(pin, states::IS_INPUT);
    store
        .ensure_object(
            &is_input_path,
            ObjectDescriptor::state(
                format!("{} is input", name),
                roles::INDICATOR,
                ValueType::Boolean,
                true,
                false,
            ),
        )
        .await?;
    store.set_state(&is_input_path, is_input.into(), true).await?;

    let sensor_states = [
        (states::TEMPERATURE, roles::TEMPERATURE, "temperature"),
        (states::HUMIDITY, roles::HUMIDITY, "humidity"),
    ];
    for (suffix, role_name, label) in sensor_states {
        let path = state_id(pin, suffix);
        if role.is_temp_hum() {
            store
                .ensure_object(
                    &path,
                    ObjectDescriptor::state(
                        format!("{} {}", name, label),
                        role_name,
                        ValueType::Number,
                        true,
                        false,
                    ),
                )
                .await?;
        } else {
            store.delete_object(&path, false).await?;
        }
    }

    Ok(())
}

/// Sync every configured pin, then remove objects of pins that are no
/// longer configured.
pub async fn sync_all(store: &dyn StateStore, config: &AdapterConfig) -> Result<()> {
    for port in &config.gpio_settings {
        sync_port(store, port.pin, Some(port)).await?;
    }

    let configured: HashSet<u32> = config.gpio_settings.iter().map(|p| p.pin).collect();
    let mut orphans: Vec<u32> = store
        .list_objects(&namespace_prefix())
        .await?
        .iter()
        .filter_map(|id| parse_path(id).map(|(pin, _)| pin))
        .filter(|pin| !configured.contains(pin))
        .collect();
    orphans.sort_unstable();
    orphans.dedup();

    for pin in orphans {
        info!(pin, "Removing objects of unconfigured GPIO");
        store.delete_object(&channel_id(pin), true).await?;
    }

    Ok(())
}

/// Delete every object the adapter owns.
///
/// Failures are logged and skipped so one bad object does not block a
/// forced re-initialization.
pub async fn purge_all(store: &dyn StateStore) {
    let ids = match store.list_objects(&namespace_prefix()).await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(error = %e, "Cannot list objects for forced re-initialization");
            return;
        }
    };

    info!(objects = ids.len(), "Forced re-initialization, deleting all objects");
    for id in ids {
        if let Err(e) = store.delete_object(&id, true).await {
            warn!(object = %id, error = %e, "Cannot delete object");
        }
    }
}

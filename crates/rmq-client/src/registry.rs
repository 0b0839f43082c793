//! Process-wide manager registry.
//!
//! One publish manager and one pull manager per data-source name, fronted by
//! reader/writer locks. Registration is double-checked: creation happens
//! outside the lock and the first writer wins.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::consumer::PullManager;
use crate::error::{ClientError, Result};
use crate::publisher::PublishManager;

static PUBLISHERS: Lazy<RwLock<HashMap<String, PublishManager>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

static PULLERS: Lazy<RwLock<HashMap<String, PullManager>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Look up the publish manager for a data source.
pub fn get_publish_manager(data_source: &str) -> Result<PublishManager> {
    PUBLISHERS
        .read()
        .get(data_source)
        .cloned()
        .ok_or_else(|| ClientError::ManagerNotFound(data_source.to_string()))
}

/// Look up the pull manager for a data source.
pub fn get_pull_manager(data_source: &str) -> Result<PullManager> {
    PULLERS
        .read()
        .get(data_source)
        .cloned()
        .ok_or_else(|| ClientError::ManagerNotFound(data_source.to_string()))
}

pub(crate) fn lookup_publish(data_source: &str) -> Option<PublishManager> {
    PUBLISHERS.read().get(data_source).cloned()
}

/// First registration wins; a racing duplicate gets the existing manager
/// back as the error value.
pub(crate) fn register_publish(
    data_source: &str,
    manager: PublishManager,
) -> std::result::Result<(), PublishManager> {
    let mut registry = PUBLISHERS.write();
    if let Some(existing) = registry.get(data_source) {
        return Err(existing.clone());
    }
    registry.insert(data_source.to_string(), manager);
    Ok(())
}

pub(crate) fn deregister_publish(data_source: &str) {
    PUBLISHERS.write().remove(data_source);
}

pub(crate) fn lookup_pull(data_source: &str) -> Option<PullManager> {
    PULLERS.read().get(data_source).cloned()
}

pub(crate) fn register_pull(
    data_source: &str,
    manager: PullManager,
) -> std::result::Result<(), PullManager> {
    let mut registry = PULLERS.write();
    if let Some(existing) = registry.get(data_source) {
        return Err(existing.clone());
    }
    registry.insert(data_source.to_string(), manager);
    Ok(())
}

pub(crate) fn deregister_pull(data_source: &str) {
    PULLERS.write().remove(data_source);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AmqpConfig;

    fn config(name: &str) -> AmqpConfig {
        AmqpConfig { data_source: name.to_string(), ..AmqpConfig::default() }
    }

    #[tokio::test]
    async fn test_missing_manager() {
        let err = get_publish_manager("registry-no-such").unwrap_err();
        assert!(matches!(err, ClientError::ManagerNotFound(_)));
        assert_eq!(err.code(), "MANAGER_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_register_lookup_deregister() {
        let manager = PublishManager::disconnected_for_tests(config("registry-rt"));
        register_publish("registry-rt", manager.clone()).unwrap();

        let found = get_publish_manager("registry-rt").unwrap();
        assert_eq!(found.data_source(), "registry-rt");

        deregister_publish("registry-rt");
        assert!(get_publish_manager("registry-rt").is_err());
    }

    #[tokio::test]
    async fn test_duplicate_registration_returns_existing() {
        let first = PublishManager::disconnected_for_tests(config("registry-dup"));
        register_publish("registry-dup", first).unwrap();

        let second = PublishManager::disconnected_for_tests(config("registry-dup"));
        let existing = register_publish("registry-dup", second).unwrap_err();
        assert_eq!(existing.data_source(), "registry-dup");

        deregister_publish("registry-dup");
    }

    #[tokio::test]
    async fn test_close_removes_from_registry() {
        let manager = PublishManager::disconnected_for_tests(config("registry-close"));
        register_publish("registry-close", manager.clone()).unwrap();

        manager.close().await.unwrap();
        assert!(get_publish_manager("registry-close").is_err());
    }
}

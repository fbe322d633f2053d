use anyhow::Result;

pub const WIFI_NAMESPACE: &str = "wifi_config";
pub const REGISTRATION_NAMESPACE: &str = "registration";

/// Namespaced, persistent string storage that survives deep sleep.
pub trait KvStore: Send + Sync {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>>;
    fn set(&self, namespace: &str, key: &str, value: &str) -> Result<()>;

    /// Writes every pair, or none of them: on a failed write the keys
    /// already written get their previous values back.
    fn set_all(&self, namespace: &str, pairs: &[(&str, &str)]) -> Result<()> {
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, _) in pairs {
            previous.push(self.get(namespace, key)?.unwrap_or_default());
        }

        for (written, (key, value)) in pairs.iter().enumerate() {
            if let Err(e) = self.set(namespace, key, value) {
                for ((key, _), old) in pairs.iter().zip(&previous).take(written) {
                    if let Err(restore) = self.set(namespace, key, old) {
                        log::error!("{namespace}/{key}: cannot restore: {restore:?}");
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Copies `value` into a bounded string, `None` if it does not fit.
pub fn bounded<const N: usize>(value: &str) -> Option<heapless::String<N>> {
    let mut out = heapless::String::new();
    out.push_str(value).ok()?;
    Some(out)
}

/// Loads a stored value into a bounded string. Missing or oversized values
/// read as empty.
pub fn load_bounded<const N: usize>(
    store: &dyn KvStore,
    namespace: &str,
    key: &str,
) -> Result<heapless::String<N>> {
    let value = store.get(namespace, key)?.unwrap_or_default();
    Ok(bounded(&value).unwrap_or_else(|| {
        log::warn!("{namespace}/{key}: stored value exceeds {N} bytes, ignored");
        heapless::String::new()
    }))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::MemStore;

    #[test]
    fn bounded_rejects_overflow() {
        assert_eq!(bounded::<4>("abcd").as_deref(), Some("abcd"));
        assert!(bounded::<4>("abcde").is_none());
    }

    #[test]
    fn load_bounded_missing_is_empty() {
        let store = MemStore::default();
        let v: heapless::String<8> = load_bounded(&store, WIFI_NAMESPACE, "ssid").unwrap();
        assert!(v.is_empty());

        store.set(WIFI_NAMESPACE, "ssid", "a-very-long-name").unwrap();
        let v: heapless::String<8> = load_bounded(&store, WIFI_NAMESPACE, "ssid").unwrap();
        assert!(v.is_empty());
    }

    #[test]
    fn set_all_restores_on_failure() {
        let store = MemStore::default();
        store.set(WIFI_NAMESPACE, "ssid", "Home").unwrap();
        store.fail_key("password");

        assert!(store
            .set_all(WIFI_NAMESPACE, &[("ssid", "Office"), ("password", "secret123")])
            .is_err());
        assert_eq!(store.get(WIFI_NAMESPACE, "ssid").unwrap().as_deref(), Some("Home"));
        assert_eq!(store.get(WIFI_NAMESPACE, "password").unwrap(), None);
    }
}

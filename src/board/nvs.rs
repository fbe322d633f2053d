use std::sync::Mutex;

use anyhow::{anyhow, Result};
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};

use crate::store::KvStore;

const VALUE_MAX: usize = 256;

/// Namespaced strings in the default NVS partition.
pub struct NvsStore {
    partition: Mutex<EspDefaultNvsPartition>,
}

impl NvsStore {
    pub fn new(partition: EspDefaultNvsPartition) -> Self {
        Self {
            partition: Mutex::new(partition),
        }
    }

    fn open(&self, namespace: &str) -> Result<EspNvs<NvsDefault>> {
        let partition = self.partition.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
        Ok(EspNvs::new(partition.clone(), namespace, true)?)
    }
}

impl KvStore for NvsStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let nvs = self.open(namespace)?;
        let mut buf = [0u8; VALUE_MAX];
        Ok(nvs.get_str(key, &mut buf)?.map(str::to_owned))
    }

    fn set(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        let mut nvs = self.open(namespace)?;
        nvs.set_str(key, value)?;
        Ok(())
    }
}

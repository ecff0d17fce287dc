use tracing::{error, info, warn};

use crate::{
    config::Configuration,
    error::{StorageError, StoreError},
    topics::CONFIG_PATH,
};

/// Byte-level persistent medium.
///
/// `write` must replace the whole file: a later `read` sees either the old
/// bytes or the new ones, never a mix.
pub trait Storage {
    fn mount(&mut self) -> Result<(), StorageError>;
    fn read(&mut self, path: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn write(&mut self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;
    fn delete(&mut self, path: &str) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MountState {
    Unmounted,
    Mounted,
    Failed,
}

/// Validates, persists and loads the node [`Configuration`].
pub struct ConfigStore<S> {
    storage: S,
    mount: MountState,
}

impl<S: Storage> ConfigStore<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            mount: MountState::Unmounted,
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn load(&mut self) -> Result<Configuration, StoreError> {
        self.ensure_mounted()?;

        let raw = self
            .storage
            .read(CONFIG_PATH)?
            .ok_or(StoreError::NotFound)?;

        let config = match serde_json::from_slice::<Configuration>(&raw) {
            Ok(config) => config,
            Err(err) => {
                warn!("persisted configuration is malformed ({err}); removing it");
                self.discard();
                return Err(StoreError::Parse(err));
            }
        };

        if let Err(err) = config.validate() {
            warn!("persisted configuration is invalid ({err}); removing it");
            self.discard();
            return Err(StoreError::Invalid(err));
        }

        Ok(config)
    }

    pub fn save(&mut self, config: &Configuration) -> Result<(), StoreError> {
        if let Err(err) = config.validate() {
            warn!("refusing to persist invalid configuration: {err}");
            return Err(StoreError::Invalid(err));
        }

        self.ensure_mounted()?;
        let payload = serde_json::to_vec(config).map_err(encode_error)?;
        self.storage.write(CONFIG_PATH, &payload)?;
        info!("configuration saved for device `{}`", config.device_name);
        Ok(())
    }

    pub fn reset(&mut self) -> Result<(), StoreError> {
        self.ensure_mounted()?;
        self.storage.delete(CONFIG_PATH)?;
        info!("persisted configuration removed");
        Ok(())
    }

    fn discard(&mut self) {
        if let Err(err) = self.storage.delete(CONFIG_PATH) {
            warn!("failed to remove persisted configuration: {err}");
        }
    }

    fn ensure_mounted(&mut self) -> Result<(), StorageError> {
        match self.mount {
            MountState::Mounted => Ok(()),
            MountState::Failed => Err(StorageError::Unavailable),
            MountState::Unmounted => match self.storage.mount() {
                Ok(()) => {
                    self.mount = MountState::Mounted;
                    Ok(())
                }
                Err(err) => {
                    error!("failed to mount configuration storage: {err}");
                    self.mount = MountState::Failed;
                    Err(err)
                }
            },
        }
    }
}

fn encode_error(err: serde_json::Error) -> StoreError {
    StoreError::Storage(StorageError::Backend(format!(
        "failed to encode configuration: {err}"
    )))
}

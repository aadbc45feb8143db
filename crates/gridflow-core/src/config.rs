use directories::{BaseDirs, ProjectDirs};
use eyre::{eyre, Context, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

pub const PROPERTIES_FILE_NAME: &str = "transfer.toml";

static CONFIG_DIR_OVERRIDE: Lazy<RwLock<Option<PathBuf>>> = Lazy::new(|| RwLock::new(None));

/// Override the configuration directory for the current process.
/// Subsequent calls replace the previous override.
pub fn set_config_dir<P: AsRef<Path>>(path: P) {
    *CONFIG_DIR_OVERRIDE.write() = Some(path.as_ref().to_path_buf());
}

/// Clear any previously configured override.
pub fn clear_config_dir_override() {
    CONFIG_DIR_OVERRIDE.write().take();
}

/// Return the current override path, if one has been set.
pub fn config_dir_override() -> Option<PathBuf> {
    CONFIG_DIR_OVERRIDE.read().clone()
}

/// Resolve the configuration directory.
/// Priority: explicit override -> platform standard -> ~/.config/gridflow
pub fn config_dir() -> Result<PathBuf> {
    if let Some(path) = CONFIG_DIR_OVERRIDE.read().clone() {
        return Ok(path);
    }

    if let Some(proj) = ProjectDirs::from("org", "Gridflow", "Gridflow") {
        return Ok(proj.config_dir().to_path_buf());
    }

    if let Some(base) = BaseDirs::new() {
        return Ok(base.home_dir().join(".config").join("gridflow"));
    }

    Err(eyre!(
        "unable to determine configuration directory for gridflow (no override and no platform default)"
    ))
}

/// Directory holding file-backed restart checkpoints.
pub fn restart_dir() -> Result<PathBuf> {
    Ok(config_dir()?.join("restart"))
}

/// Cipher negotiated for encrypted parallel sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionAlgorithm {
    #[serde(rename = "AES-256-CBC")]
    Aes256Cbc,
    #[serde(rename = "AES-192-CBC")]
    Aes192Cbc,
    #[serde(rename = "AES-128-CBC")]
    Aes128Cbc,
}

impl EncryptionAlgorithm {
    pub fn key_size(self) -> usize {
        match self {
            EncryptionAlgorithm::Aes256Cbc => 32,
            EncryptionAlgorithm::Aes192Cbc => 24,
            EncryptionAlgorithm::Aes128Cbc => 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CipherConfig {
    pub algorithm: EncryptionAlgorithm,
    /// Derived key length in bytes; must match the algorithm.
    pub key_size: usize,
    pub salt_size: usize,
    pub hash_rounds: u32,
}

impl Default for CipherConfig {
    fn default() -> Self {
        Self {
            algorithm: EncryptionAlgorithm::Aes256Cbc,
            key_size: 32,
            salt_size: 8,
            hash_rounds: 16,
        }
    }
}

/// Tunables consumed by workers, strategies, and restart processors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferProperties {
    /// Copy buffer used by each parallel worker.
    pub parallel_copy_buffer_size: usize,
    /// Copy buffer used when replaying restart gaps.
    pub put_buffer_size: usize,
    /// Socket read/write timeout; zero leaves the socket blocking forever.
    pub socket_timeout_secs: u64,
    /// SO_SNDBUF in KiB; zero keeps the OS default.
    pub tcp_send_window_kib: usize,
    /// SO_RCVBUF in KiB; zero keeps the OS default.
    pub tcp_receive_window_kib: usize,
    pub tcp_keep_alive: bool,
    pub tcp_nodelay: bool,
    /// -1 unbuffered, 0 default-sized buffer, >0 explicit size.
    pub input_buffer_size: i64,
    /// -1 unbuffered, 0 default-sized buffer, >0 explicit size.
    pub output_buffer_size: i64,
    /// Use the zero-copy PUT worker when the session is not encrypted.
    pub use_channel_put: bool,
    pub long_transfer_restart: bool,
    pub max_restart_attempts: u32,
    pub intra_file_status_calls_interval: u32,
    pub intra_file_status_bytes_interval: u64,
    pub cipher: CipherConfig,
}

impl Default for TransferProperties {
    fn default() -> Self {
        Self {
            parallel_copy_buffer_size: 4 * MIB,
            put_buffer_size: 4 * MIB,
            socket_timeout_secs: 0,
            tcp_send_window_kib: 0,
            tcp_receive_window_kib: 0,
            tcp_keep_alive: true,
            tcp_nodelay: false,
            input_buffer_size: 0,
            output_buffer_size: 0,
            use_channel_put: false,
            long_transfer_restart: false,
            max_restart_attempts: 5,
            intra_file_status_calls_interval: 5,
            intra_file_status_bytes_interval: 4 * MIB as u64,
            cipher: CipherConfig::default(),
        }
    }
}

impl TransferProperties {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read config file: {}", path.display()))?;

        let properties: TransferProperties =
            toml::from_str(&content).wrap_err("failed to parse config file")?;
        properties.validate()?;
        Ok(properties)
    }

    /// Load `transfer.toml` from the config directory, falling back to defaults
    /// when the file does not exist.
    pub fn load_or_default() -> Result<Self> {
        let path = config_dir()?.join(PROPERTIES_FILE_NAME);
        if path.exists() {
            Self::load(&path)
        } else {
            log::debug!("no {} found, using default transfer properties", path.display());
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallel_copy_buffer_size == 0 {
            return Err(eyre!("parallel_copy_buffer_size must be greater than zero"));
        }
        if self.put_buffer_size == 0 {
            return Err(eyre!("put_buffer_size must be greater than zero"));
        }
        if self.input_buffer_size < -1 || self.output_buffer_size < -1 {
            return Err(eyre!("stream buffer sizes must be >= -1"));
        }
        if self.cipher.key_size != self.cipher.algorithm.key_size() {
            return Err(eyre!(
                "cipher key_size {} does not match {:?}",
                self.cipher.key_size,
                self.cipher.algorithm
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_validate() {
        TransferProperties::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(PROPERTIES_FILE_NAME);
        std::fs::write(
            &path,
            "parallel_copy_buffer_size = 65536\nlong_transfer_restart = true\n\n[cipher]\nsalt_size = 16\n",
        )
        .unwrap();

        let props = TransferProperties::load(&path).unwrap();
        assert_eq!(props.parallel_copy_buffer_size, 65536);
        assert!(props.long_transfer_restart);
        assert_eq!(props.cipher.salt_size, 16);
        assert_eq!(props.cipher.key_size, 32);
        assert_eq!(props.max_restart_attempts, 5);
    }

    #[test]
    fn mismatched_key_size_is_rejected() {
        let mut props = TransferProperties::default();
        props.cipher.algorithm = EncryptionAlgorithm::Aes128Cbc;
        assert!(props.validate().is_err());
        props.cipher.key_size = 16;
        props.validate().unwrap();
    }

    #[test]
    fn override_wins() {
        let dir = tempdir().unwrap();
        set_config_dir(dir.path());
        assert_eq!(config_dir().unwrap(), dir.path());
        assert_eq!(restart_dir().unwrap(), dir.path().join("restart"));
        clear_config_dir_override();
        assert!(config_dir_override().is_none());
    }
}

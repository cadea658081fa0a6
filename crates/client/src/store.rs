use crate::error::{ClientError, ClientResult};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use directories::ProjectDirs;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Durable string key-value storage for client-local state.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> ClientResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> ClientResult<()>;
    fn delete(&self, key: &str) -> ClientResult<()>;
}

#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> ClientResult<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.values
            .lock()
            .map_err(|_| ClientError::Storage("memory store poisoned".to_string()))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> ClientResult<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> ClientResult<()> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> ClientResult<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}

/// Key-value map persisted as one AES-256-GCM encrypted JSON file. The key is
/// loaded (or generated) once at open and kept next to the data, owner-only.
pub struct FileStore {
    data_path: PathBuf,
    cipher: Aes256Gcm,
    write_lock: Mutex<()>,
}

impl FileStore {
    const DATA_FILE: &'static str = "store.bin";
    const KEY_FILE: &'static str = ".secret_key";

    /// Store under the platform data directory.
    pub fn open_default() -> ClientResult<Self> {
        let proj_dirs = ProjectDirs::from("com", "portico", "portico").ok_or_else(|| {
            ClientError::Storage("Could not determine project directories".to_string())
        })?;
        Self::open(proj_dirs.data_dir())
    }

    pub fn open(dir: impl AsRef<Path>) -> ClientResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let key = load_or_create_key(&dir.join(Self::KEY_FILE))?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| ClientError::Crypto("Invalid key length".to_string()))?;
        Ok(Self {
            data_path: dir.join(Self::DATA_FILE),
            cipher,
            write_lock: Mutex::new(()),
        })
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    fn load(&self) -> ClientResult<HashMap<String, String>> {
        let sealed = match fs::read(&self.data_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&self.unseal(&sealed)?)?)
    }

    fn update(&self, apply: impl FnOnce(&mut HashMap<String, String>)) -> ClientResult<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| ClientError::Storage("file store poisoned".to_string()))?;
        let mut values = self.load()?;
        apply(&mut values);
        let sealed = self.seal(&serde_json::to_vec(&values)?)?;
        write_private(&self.data_path, &sealed)
    }

    /// Random nonce followed by the ciphertext.
    fn seal(&self, plaintext: &[u8]) -> ClientResult<Vec<u8>> {
        let nonce: [u8; NONCE_LEN] = rand::random();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| ClientError::Crypto("Encryption failed".to_string()))?;
        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn unseal(&self, sealed: &[u8]) -> ClientResult<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(ClientError::Crypto("Invalid ciphertext".to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ClientError::Crypto("Decryption failed".to_string()))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> ClientResult<Option<String>> {
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> ClientResult<()> {
        self.update(|values| {
            values.insert(key.to_string(), value.to_string());
        })
    }

    fn delete(&self, key: &str) -> ClientResult<()> {
        self.update(|values| {
            values.remove(key);
        })
    }
}

fn load_or_create_key(path: &Path) -> ClientResult<[u8; KEY_LEN]> {
    match fs::read(path) {
        Ok(bytes) => match <[u8; KEY_LEN]>::try_from(bytes.as_slice()) {
            Ok(key) => return Ok(key),
            Err(_) => warn!("Replacing malformed key file {}", path.display()),
        },
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let key: [u8; KEY_LEN] = rand::random();
    write_private(path, &key)?;
    Ok(key)
}

fn write_private(path: &Path, bytes: &[u8]) -> ClientResult<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)?.write_all(bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static NEXT_DIR: AtomicU32 = AtomicU32::new(0);

    fn scratch_dir() -> PathBuf {
        let n = NEXT_DIR.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!("portico-store-{}-{}", std::process::id(), n));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn memory_store_set_get_delete() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").unwrap(), None);
        store.set("k", "v").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
        store.delete("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn file_store_persists_across_instances() {
        let dir = scratch_dir();
        {
            let store = FileStore::open(&dir).unwrap();
            store.set("portico-gateway-configured", "true").unwrap();
            store.set("token", "secret-bearer").unwrap();
        }

        let reopened = FileStore::open(&dir).unwrap();
        assert_eq!(
            reopened.get("portico-gateway-configured").unwrap().as_deref(),
            Some("true")
        );
        reopened.delete("portico-gateway-configured").unwrap();
        assert_eq!(reopened.get("portico-gateway-configured").unwrap(), None);
        assert_eq!(reopened.get("token").unwrap().as_deref(), Some("secret-bearer"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn file_store_does_not_write_plaintext() {
        let dir = scratch_dir();
        let store = FileStore::open(&dir).unwrap();
        store.set("token", "very-secret-bearer").unwrap();

        let raw = fs::read(store.data_path()).unwrap();
        let needle = b"very-secret-bearer";
        assert!(!raw.windows(needle.len()).any(|w| w == needle));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupted_file_reports_crypto_error() {
        let dir = scratch_dir();
        let store = FileStore::open(&dir).unwrap();
        store.set("a", "b").unwrap();
        fs::write(store.data_path(), b"short").unwrap();

        assert!(matches!(store.get("a"), Err(ClientError::Crypto(_))));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn key_is_loaded_once_at_open() {
        let dir = scratch_dir();
        let store = FileStore::open(&dir).unwrap();
        store.set("a", "b").unwrap();

        fs::remove_file(dir.join(".secret_key")).unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("b"));
        store.set("c", "d").unwrap();
        assert_eq!(store.get("c").unwrap().as_deref(), Some("d"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn malformed_key_file_is_replaced() {
        let dir = scratch_dir();
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(".secret_key"), b"too short").unwrap();

        let store = FileStore::open(&dir).unwrap();
        store.set("a", "b").unwrap();
        assert_eq!(fs::read(dir.join(".secret_key")).unwrap().len(), KEY_LEN);
        assert_eq!(store.get("a").unwrap().as_deref(), Some("b"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[cfg(unix)]
    #[test]
    fn files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = scratch_dir();
        let store = FileStore::open(&dir).unwrap();
        store.set("a", "b").unwrap();

        for path in [dir.join(".secret_key"), store.data_path().to_path_buf()] {
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600, "{}", path.display());
        }

        let _ = fs::remove_dir_all(&dir);
    }
}

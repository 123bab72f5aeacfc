//! Key-encrypting key pair and the sealed database key.
//!
//! The private half of the KEK never leaves its `KeyStore` unless an
//! `Authenticator` has granted a live `AuthContext`. Writers (spool, blob
//! storage) only ever need the public half.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use thiserror::Error;
use zeroize::Zeroizing;

use crate::utils::fs::{write_atomic, write_atomic_private};

use super::envelope::{
    self, ContentKey, ContentKeyUnwrapper, ContentType, EnvelopeError, KekPublic, KekSecret,
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const WRAPPED_KEY_PAYLOAD: &str = "wrapped-key";

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("no {0:?} key pair exists")]
    Missing(KeyScope),
    #[error("no sealed database key exists")]
    NoDatabaseKey,
    #[error("authentication denied: {0}")]
    AuthDenied(String),
    #[error("authentication context expired")]
    AuthExpired,
    #[error("hardware-backed key storage is unavailable")]
    HardwareUnavailable,
    #[error("key store I/O failed: {0}")]
    Store(#[from] io::Error),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Which generation of the key pair a key belongs to.
///
/// `Shared` is reachable from every process of the app. `Legacy` keys were
/// created before that and are only read, never created, so records sealed
/// under them can be migrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyScope {
    Shared,
    Legacy,
}

impl KeyScope {
    fn file_stem(self) -> &'static str {
        match self {
            KeyScope::Shared => "kek-shared",
            KeyScope::Legacy => "kek-legacy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyBacking {
    Hardware,
    Software,
}

/// Proof of a successful biometric/passcode challenge. Valid only for the
/// window the platform granted; nothing here extends it.
#[derive(Debug, Clone)]
pub struct AuthContext {
    granted_at: Instant,
    valid_for: Duration,
}

impl AuthContext {
    pub fn new(granted_at: Instant, valid_for: Duration) -> Self {
        Self {
            granted_at,
            valid_for,
        }
    }

    pub fn is_valid_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.granted_at) < self.valid_for
    }

    pub fn ensure_valid(&self) -> Result<(), KeyError> {
        if self.is_valid_at(Instant::now()) {
            Ok(())
        } else {
            Err(KeyError::AuthExpired)
        }
    }
}

/// Platform biometric/passcode gate.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, reason: &str) -> Result<AuthContext, KeyError>;
}

/// Persistent home of the key pair and the sealed database key.
pub trait KeyStore: Send + Sync {
    fn backing(&self) -> KeyBacking;

    /// Hardware stores report `false` on hosts without a secure element.
    fn is_available(&self) -> bool {
        true
    }

    fn load_public(&self, scope: KeyScope) -> Result<Option<KekPublic>, KeyError>;

    fn create(&self, scope: KeyScope) -> Result<KekPublic, KeyError>;

    fn load_secret(&self, scope: KeyScope, auth: &AuthContext)
        -> Result<Option<KekSecret>, KeyError>;

    fn read_sealed_key(&self) -> Result<Option<Vec<u8>>, KeyError>;

    /// Must replace the blob atomically.
    fn write_sealed_key(&self, sealed: &[u8]) -> Result<(), KeyError>;
}

/// Software-protected store: one directory, owner-only private key files.
pub struct FileKeyStore {
    dir: PathBuf,
}

impl FileKeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn secret_path(&self, scope: KeyScope) -> PathBuf {
        self.dir.join(format!("{}.key", scope.file_stem()))
    }

    fn public_path(&self, scope: KeyScope) -> PathBuf {
        self.dir.join(format!("{}.pub", scope.file_stem()))
    }

    fn sealed_key_path(&self) -> PathBuf {
        self.dir.join("database-key.tse")
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, KeyError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(KeyError::Store(err)),
    }
}

fn corrupt(path: &Path) -> KeyError {
    KeyError::Store(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("{} does not hold a 32-byte key", path.display()),
    ))
}

impl KeyStore for FileKeyStore {
    fn backing(&self) -> KeyBacking {
        KeyBacking::Software
    }

    fn load_public(&self, scope: KeyScope) -> Result<Option<KekPublic>, KeyError> {
        let path = self.public_path(scope);
        match read_optional(&path)? {
            Some(bytes) => KekPublic::from_slice(&bytes)
                .map(Some)
                .ok_or_else(|| corrupt(&path)),
            None => Ok(None),
        }
    }

    fn create(&self, scope: KeyScope) -> Result<KekPublic, KeyError> {
        let secret = KekSecret::generate();
        write_atomic_private(&self.secret_path(scope), &secret.to_bytes()[..])?;
        write_atomic(&self.public_path(scope), &secret.public().to_bytes())?;
        Ok(secret.public().clone())
    }

    fn load_secret(
        &self,
        scope: KeyScope,
        auth: &AuthContext,
    ) -> Result<Option<KekSecret>, KeyError> {
        auth.ensure_valid()?;
        let path = self.secret_path(scope);
        match read_optional(&path)? {
            Some(bytes) => {
                let bytes = Zeroizing::new(bytes);
                KekSecret::from_slice(&bytes)
                    .map(Some)
                    .ok_or_else(|| corrupt(&path))
            }
            None => Ok(None),
        }
    }

    fn read_sealed_key(&self) -> Result<Option<Vec<u8>>, KeyError> {
        read_optional(&self.sealed_key_path())
    }

    fn write_sealed_key(&self, sealed: &[u8]) -> Result<(), KeyError> {
        write_atomic(&self.sealed_key_path(), sealed)?;
        Ok(())
    }
}

/// Private keys and the database key, available only between unlock and
/// lock. Dropping the last handle wipes the key material.
pub struct UnlockedKeys {
    database_key: ContentKey,
    secrets: Vec<KekSecret>,
}

impl UnlockedKeys {
    /// Key for the searchable store's own at-rest encryption.
    pub fn database_key(&self) -> &ContentKey {
        &self.database_key
    }

    pub fn kek_ids(&self) -> impl Iterator<Item = &str> {
        self.secrets.iter().map(|secret| secret.public().id())
    }
}

impl ContentKeyUnwrapper for UnlockedKeys {
    fn unwrap_content_key(&self, kek_id: &str, wrapped: &[u8]) -> Result<ContentKey, EnvelopeError> {
        self.secrets.as_slice().unwrap_content_key(kek_id, wrapped)
    }
}

/// Outcome of unwrapping a sealed blob.
pub struct Unwrapped {
    pub key: ContentKey,
    /// Set when the blob was sealed under the legacy key and has been
    /// re-sealed under the shared key.
    pub rewrapped: Option<Vec<u8>>,
}

pub struct KeyManager {
    hardware: Option<Arc<dyn KeyStore>>,
    software: Arc<dyn KeyStore>,
    authenticator: Arc<dyn Authenticator>,
    unlocked: RwLock<Option<Arc<UnlockedKeys>>>,
}

impl KeyManager {
    pub fn new(software: Arc<dyn KeyStore>, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            hardware: None,
            software,
            authenticator,
            unlocked: RwLock::new(None),
        }
    }

    /// Prefers `hardware` whenever it is available on this host.
    pub fn with_hardware(
        hardware: Arc<dyn KeyStore>,
        software: Arc<dyn KeyStore>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            hardware: Some(hardware),
            ..Self::new(software, authenticator)
        }
    }

    fn store(&self) -> &dyn KeyStore {
        match &self.hardware {
            Some(hardware) if hardware.is_available() => hardware.as_ref(),
            _ => self.software.as_ref(),
        }
    }

    pub fn backing(&self) -> KeyBacking {
        self.store().backing()
    }

    /// Creates the shared key pair on first use. Idempotent.
    pub fn ensure_key_pair(&self) -> Result<KekPublic, KeyError> {
        let store = self.store();
        if let Some(public) = store.load_public(KeyScope::Shared)? {
            return Ok(public);
        }
        let public = store.create(KeyScope::Shared)?;
        log_info!(
            "created {:?}-backed key pair {}",
            store.backing(),
            public.id()
        );
        Ok(public)
    }

    pub fn public_key(&self) -> Result<KekPublic, KeyError> {
        self.store()
            .load_public(KeyScope::Shared)?
            .ok_or(KeyError::Missing(KeyScope::Shared))
    }

    /// Generates and seals the database key once. Needs no authentication:
    /// sealing only uses the public key.
    pub fn ensure_database_key(&self) -> Result<(), KeyError> {
        let store = self.store();
        if store.read_sealed_key()?.is_some() {
            return Ok(());
        }
        let public = self.ensure_key_pair()?;
        let sealed = self.wrap(&ContentKey::generate(), &public)?;
        store.write_sealed_key(&sealed)?;
        log_info!("sealed new database key under {}", public.id());
        Ok(())
    }

    pub fn wrap(&self, key: &ContentKey, public: &KekPublic) -> Result<Vec<u8>, KeyError> {
        let payload = ContentType::Payload {
            payload_type: WRAPPED_KEY_PAYLOAD.to_string(),
        };
        let envelope = envelope::seal(&key.as_bytes()[..], payload, public)?;
        Ok(envelope.to_bytes())
    }

    /// Opens a blob from `wrap`. Falls back to the legacy key when the blob
    /// predates the shared key, and returns a re-sealed copy in that case.
    pub fn unwrap(&self, sealed: &[u8], auth: &AuthContext) -> Result<Unwrapped, KeyError> {
        let secrets = self.load_secrets(auth)?;
        self.unwrap_with(sealed, &secrets)
    }

    fn unwrap_with(&self, sealed: &[u8], secrets: &[KekSecret]) -> Result<Unwrapped, KeyError> {
        let header = envelope::peek_header(sealed)?;
        let (_, plaintext) = envelope::open(sealed, secrets)?;
        let plaintext = Zeroizing::new(plaintext);
        let key = ContentKey::from_slice(&plaintext).ok_or(EnvelopeError::Unwrap)?;

        let shared = secrets.first().map(|secret| secret.public().clone());
        let rewrapped = match shared {
            Some(shared) if shared.id() != header.kek_id => {
                log_info!(
                    "re-wrapping key sealed under legacy kek {} to {}",
                    header.kek_id,
                    shared.id()
                );
                Some(self.wrap(&key, &shared)?)
            }
            _ => None,
        };

        Ok(Unwrapped { key, rewrapped })
    }

    /// Shared key first, then legacy if one exists.
    fn load_secrets(&self, auth: &AuthContext) -> Result<Vec<KekSecret>, KeyError> {
        let store = self.store();
        let shared = store
            .load_secret(KeyScope::Shared, auth)?
            .ok_or(KeyError::Missing(KeyScope::Shared))?;
        let mut secrets = vec![shared];
        if let Some(legacy) = store.load_secret(KeyScope::Legacy, auth)? {
            secrets.push(legacy);
        }
        Ok(secrets)
    }

    /// Runs the authentication challenge and unseals the database key. A
    /// legacy-sealed blob is migrated in place on success.
    pub fn unlock(&self, reason: &str) -> Result<Arc<UnlockedKeys>, KeyError> {
        let auth = self.authenticator.authenticate(reason)?;
        let store = self.store();
        let sealed = store.read_sealed_key()?.ok_or(KeyError::NoDatabaseKey)?;

        let secrets = self.load_secrets(&auth)?;
        let unwrapped = self.unwrap_with(&sealed, &secrets)?;
        if let Some(rewrapped) = &unwrapped.rewrapped {
            if let Err(err) = store.write_sealed_key(rewrapped) {
                // The legacy blob is still intact; the next unlock retries.
                log_warn!("failed to persist re-wrapped database key: {err}");
            }
        }

        let keys = Arc::new(UnlockedKeys {
            database_key: unwrapped.key,
            secrets,
        });
        *self.unlocked.write().unwrap_or_else(|p| p.into_inner()) = Some(Arc::clone(&keys));
        Ok(keys)
    }

    pub fn current_unlocked(&self) -> Option<Arc<UnlockedKeys>> {
        self.unlocked
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Forgets the unlocked handle. Outstanding clones keep working until
    /// they are dropped.
    pub fn discard(&self) {
        self.unlocked
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Gate(AtomicBool);

    impl Authenticator for Gate {
        fn authenticate(&self, _reason: &str) -> Result<AuthContext, KeyError> {
            if self.0.load(Ordering::SeqCst) {
                Ok(AuthContext::new(Instant::now(), Duration::from_secs(10)))
            } else {
                Err(KeyError::AuthDenied("user cancelled".into()))
            }
        }
    }

    fn manager(dir: &Path, allow: bool) -> (Arc<FileKeyStore>, KeyManager) {
        let store = Arc::new(FileKeyStore::new(dir));
        let manager = KeyManager::new(store.clone(), Arc::new(Gate(AtomicBool::new(allow))));
        (store, manager)
    }

    /// Secure-element stand-in that can be switched off.
    struct Enclave {
        available: AtomicBool,
        calls: AtomicUsize,
        inner: FileKeyStore,
    }

    impl Enclave {
        fn touch(&self) -> &FileKeyStore {
            self.calls.fetch_add(1, Ordering::SeqCst);
            &self.inner
        }
    }

    impl KeyStore for Enclave {
        fn backing(&self) -> KeyBacking {
            KeyBacking::Hardware
        }

        fn is_available(&self) -> bool {
            self.available.load(Ordering::SeqCst)
        }

        fn load_public(&self, scope: KeyScope) -> Result<Option<KekPublic>, KeyError> {
            self.touch().load_public(scope)
        }

        fn create(&self, scope: KeyScope) -> Result<KekPublic, KeyError> {
            self.touch().create(scope)
        }

        fn load_secret(
            &self,
            scope: KeyScope,
            auth: &AuthContext,
        ) -> Result<Option<KekSecret>, KeyError> {
            self.touch().load_secret(scope, auth)
        }

        fn read_sealed_key(&self) -> Result<Option<Vec<u8>>, KeyError> {
            self.touch().read_sealed_key()
        }

        fn write_sealed_key(&self, sealed: &[u8]) -> Result<(), KeyError> {
            self.touch().write_sealed_key(sealed)
        }
    }

    #[test]
    fn hardware_store_is_preferred_while_available() {
        let dir = tempfile::tempdir().unwrap();
        let enclave = Arc::new(Enclave {
            available: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            inner: FileKeyStore::new(dir.path().join("enclave")),
        });
        let software = Arc::new(FileKeyStore::new(dir.path().join("software")));
        let keys = KeyManager::with_hardware(
            enclave.clone(),
            software.clone(),
            Arc::new(Gate(AtomicBool::new(true))),
        );

        assert_eq!(keys.backing(), KeyBacking::Hardware);
        let hardware_public = keys.ensure_key_pair().unwrap();
        keys.ensure_database_key().unwrap();
        keys.unlock("test").unwrap();
        assert!(enclave.calls.load(Ordering::SeqCst) > 0);
        assert_eq!(
            enclave.inner.load_public(KeyScope::Shared).unwrap().unwrap().id(),
            hardware_public.id()
        );
        assert!(software.load_public(KeyScope::Shared).unwrap().is_none());
        assert!(software.read_sealed_key().unwrap().is_none());
        keys.discard();

        enclave.available.store(false, Ordering::SeqCst);
        let calls = enclave.calls.load(Ordering::SeqCst);
        assert_eq!(keys.backing(), KeyBacking::Software);
        assert!(matches!(keys.unlock("test"), Err(KeyError::NoDatabaseKey)));

        let software_public = keys.ensure_key_pair().unwrap();
        keys.ensure_database_key().unwrap();
        keys.unlock("test").unwrap();
        assert_ne!(software_public.id(), hardware_public.id());
        assert_eq!(
            software.load_public(KeyScope::Shared).unwrap().unwrap().id(),
            software_public.id()
        );
        assert_eq!(enclave.calls.load(Ordering::SeqCst), calls);
    }

    #[test]
    fn key_pair_is_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let (_, keys) = manager(dir.path(), true);

        let first = keys.ensure_key_pair().unwrap();
        let second = keys.ensure_key_pair().unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(keys.public_key().unwrap().id(), first.id());
        assert_eq!(keys.backing(), KeyBacking::Software);
    }

    #[test]
    fn unlock_requires_authentication() {
        let dir = tempfile::tempdir().unwrap();
        let (_, keys) = manager(dir.path(), false);
        keys.ensure_database_key().unwrap();

        assert!(matches!(keys.unlock("test"), Err(KeyError::AuthDenied(_))));
        assert!(keys.current_unlocked().is_none());
    }

    #[test]
    fn unlock_yields_a_stable_database_key() {
        let dir = tempfile::tempdir().unwrap();
        let (_, keys) = manager(dir.path(), true);
        keys.ensure_database_key().unwrap();
        keys.ensure_database_key().unwrap();

        let first = keys.unlock("test").unwrap();
        keys.discard();
        assert!(keys.current_unlocked().is_none());
        let second = keys.unlock("test").unwrap();

        assert_eq!(
            first.database_key().as_bytes(),
            second.database_key().as_bytes()
        );
    }

    #[test]
    fn expired_context_cannot_load_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let (store, keys) = manager(dir.path(), true);
        keys.ensure_key_pair().unwrap();

        let stale = AuthContext::new(Instant::now(), Duration::ZERO);
        assert!(matches!(
            store.load_secret(KeyScope::Shared, &stale),
            Err(KeyError::AuthExpired)
        ));
    }

    #[test]
    fn legacy_sealed_key_is_migrated_once() {
        let dir = tempfile::tempdir().unwrap();
        let (store, keys) = manager(dir.path(), true);

        let legacy = store.create(KeyScope::Legacy).unwrap();
        let original = ContentKey::generate();
        store
            .write_sealed_key(&keys.wrap(&original, &legacy).unwrap())
            .unwrap();
        let shared = keys.ensure_key_pair().unwrap();

        let unlocked = keys.unlock("test").unwrap();
        assert_eq!(unlocked.database_key().as_bytes(), original.as_bytes());

        let blob = store.read_sealed_key().unwrap().unwrap();
        assert_eq!(envelope::peek_header(&blob).unwrap().kek_id, shared.id());

        let auth = AuthContext::new(Instant::now(), Duration::from_secs(10));
        let again = keys.unwrap(&blob, &auth).unwrap();
        assert!(again.rewrapped.is_none());
        assert_eq!(again.key.as_bytes(), original.as_bytes());
    }

    #[test]
    fn unlocked_keys_open_envelopes_sealed_to_the_public_key() {
        let dir = tempfile::tempdir().unwrap();
        let (_, keys) = manager(dir.path(), true);
        keys.ensure_database_key().unwrap();
        let public = keys.public_key().unwrap();

        let sealed = envelope::seal(
            b"queued record",
            ContentType::Payload {
                payload_type: "test".into(),
            },
            &public,
        )
        .unwrap()
        .to_bytes();

        let unlocked = keys.unlock("test").unwrap();
        let (_, plain) = envelope::open(&sealed, unlocked.as_ref()).unwrap();
        assert_eq!(plain, b"queued record");
    }
}

//! Sandboxed file operations for the copy-files rule.
//!
//! Sources are resolved against the project root, destinations against the
//! session root; both go through [`SandboxRoot`] so neither side of a copy
//! can reach outside its declared tree. Files whose relative path looks like
//! a credential are treated as sensitive: tighter default permissions and,
//! when a cipher is provisioned, encryption by default.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use regex_lite::Regex;
use sha2::Digest;
use sha2::Sha256;
use tokio::fs;
use tracing::debug;
use tracing::warn;

use crate::cipher::Cipher;
use crate::error::Result;
use crate::error::SxnErr;
use crate::sandbox::SandboxRoot;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

const DEFAULT_FILE_MODE: u32 = 0o644;
const SENSITIVE_FILE_MODE: u32 = 0o600;

/// Relative source paths matching any of these are considered sensitive.
/// Only the token/secret patterns are case-insensitive.
static SENSITIVE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"master\.key$",
        r"credentials.*\.key$",
        r"\.env\..*key",
        r"(?i)auth.*token",
        r"(?i)secret",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

pub fn is_sensitive(relative_path: &Path) -> bool {
    let text = relative_path.to_string_lossy();
    SENSITIVE_PATTERNS.iter().any(|re| re.is_match(&text))
}

/// `explicit` wins when present; otherwise sensitivity decides.
pub fn should_encrypt(relative_path: &Path, explicit: Option<bool>) -> bool {
    explicit.unwrap_or_else(|| is_sensitive(relative_path))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOperation {
    Copy,
    Symlink,
    Chmod,
}

#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    /// Final mode of the destination, overriding every default.
    pub permissions: Option<u32>,
    /// Explicit encryption decision; `None` falls back to sensitivity.
    pub encrypt: Option<bool>,
    /// Carry the source file's mode over instead of the defaults.
    pub preserve_permissions: bool,
    /// mkdir -p the destination's parent. On by default.
    pub create_directories: Option<bool>,
    /// Permit overwriting an existing destination (the previous file is
    /// moved aside and reported as `backup_path`).
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct CopyResult {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub operation: CopyOperation,
    pub encrypted: bool,
    /// Hex SHA-256 of the destination bytes; copies only.
    pub checksum: Option<String>,
    pub backup_path: Option<PathBuf>,
}

pub struct SecureCopier {
    source_root: SandboxRoot,
    dest_root: SandboxRoot,
    cipher: Option<Arc<dyn Cipher>>,
}

impl SecureCopier {
    pub fn new(source_root: SandboxRoot, dest_root: SandboxRoot) -> Self {
        Self {
            source_root,
            dest_root,
            cipher: None,
        }
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn has_cipher(&self) -> bool {
        self.cipher.is_some()
    }

    /// Copy one file from the project root into the session root.
    ///
    /// `destination` defaults to the source-relative path, so
    /// `config/master.key` lands at `<session>/config/master.key`.
    pub async fn copy_file(
        &self,
        source: &Path,
        destination: Option<&Path>,
        options: &CopyOptions,
    ) -> Result<CopyResult> {
        let canonical_source = self.resolve_source(source)?;
        let dest_rel = destination.unwrap_or(source);
        let dest = self.dest_root.contain_for_create(dest_rel)?;

        let backup_path = self.prepare_destination(&dest, options).await?;

        let plaintext = fs::read(&canonical_source).await?;
        let want_encrypt = should_encrypt(source, options.encrypt);
        let (bytes, encrypted) = match (&self.cipher, want_encrypt) {
            (Some(cipher), true) => (cipher.encrypt(&plaintext)?, true),
            (None, true) if options.encrypt == Some(true) => {
                return Err(SxnErr::Encryption {
                    reason: format!(
                        "encryption requested for '{}' but no cipher is configured",
                        source.display()
                    ),
                });
            }
            (None, true) => {
                // Inferred sensitivity degrades to a plain copy with tight
                // permissions when the caller provisioned no key material.
                warn!(
                    source = %source.display(),
                    "sensitive file copied unencrypted: no cipher configured"
                );
                (plaintext, false)
            }
            (_, false) => (plaintext, false),
        };

        fs::write(&dest, &bytes).await?;
        self.apply_mode(&canonical_source, &dest, source, options)
            .await?;

        let checksum = hex::encode(Sha256::digest(&bytes));
        debug!(
            source = %canonical_source.display(),
            destination = %dest.display(),
            encrypted,
            "copied file"
        );

        Ok(CopyResult {
            source: canonical_source,
            destination: dest,
            operation: CopyOperation::Copy,
            encrypted,
            checksum: Some(checksum),
            backup_path,
        })
    }

    /// Create an absolute symlink in the session pointing at the canonical
    /// source under the project root.
    pub async fn create_symlink(
        &self,
        source: &Path,
        destination: Option<&Path>,
        options: &CopyOptions,
    ) -> Result<CopyResult> {
        let canonical_source = self.resolve_source(source)?;
        let dest_rel = destination.unwrap_or(source);
        let dest = self.dest_root.contain_for_create(dest_rel)?;

        let backup_path = self.prepare_destination(&dest, options).await?;

        symlink(&canonical_source, &dest).await?;
        debug!(
            target = %canonical_source.display(),
            link = %dest.display(),
            "created symlink"
        );

        Ok(CopyResult {
            source: canonical_source,
            destination: dest,
            operation: CopyOperation::Symlink,
            encrypted: false,
            checksum: None,
            backup_path,
        })
    }

    /// Change the mode of an existing file under the session root.
    pub async fn chmod(&self, destination: &Path, mode: u32) -> Result<CopyResult> {
        let dest = self.dest_root.contain(destination)?;
        set_mode(&dest, mode).await?;
        Ok(CopyResult {
            source: dest.clone(),
            destination: dest,
            operation: CopyOperation::Chmod,
            encrypted: false,
            checksum: None,
            backup_path: None,
        })
    }

    fn resolve_source(&self, source: &Path) -> Result<PathBuf> {
        match self.source_root.contain(source) {
            Ok(path) => Ok(path),
            Err(SxnErr::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(SxnErr::SourceMissing {
                    path: source.to_path_buf(),
                })
            }
            Err(other) => Err(other),
        }
    }

    /// Enforce overwrite policy and create parent directories. Returns the
    /// backup location when an existing destination was moved aside.
    async fn prepare_destination(
        &self,
        dest: &Path,
        options: &CopyOptions,
    ) -> Result<Option<PathBuf>> {
        let exists = fs::symlink_metadata(dest).await.is_ok();
        let mut backup_path = None;
        if exists {
            if !options.force {
                return Err(SxnErr::DestinationExists {
                    path: dest.to_path_buf(),
                });
            }
            let backup = backup_location(dest);
            fs::rename(dest, &backup).await?;
            warn!(
                destination = %dest.display(),
                backup = %backup.display(),
                "destination existed, moved aside"
            );
            backup_path = Some(backup);
        }

        if options.create_directories.unwrap_or(true)
            && let Some(parent) = dest.parent()
        {
            fs::create_dir_all(parent).await?;
        }
        Ok(backup_path)
    }

    async fn apply_mode(
        &self,
        canonical_source: &Path,
        dest: &Path,
        source_rel: &Path,
        options: &CopyOptions,
    ) -> Result<()> {
        let mode = if let Some(mode) = options.permissions {
            mode
        } else if options.preserve_permissions {
            source_mode(canonical_source).await?
        } else if is_sensitive(source_rel) {
            SENSITIVE_FILE_MODE
        } else {
            DEFAULT_FILE_MODE
        };
        set_mode(dest, mode).await
    }
}

fn backup_location(dest: &Path) -> PathBuf {
    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let mut name = dest.as_os_str().to_os_string();
    name.push(format!(".backup.{epoch}"));
    PathBuf::from(name)
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    // Mode bits are a Unix concept; nothing to enforce elsewhere.
    Ok(())
}

#[cfg(unix)]
async fn source_mode(path: &Path) -> Result<u32> {
    let metadata = fs::metadata(path).await?;
    Ok(metadata.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
async fn source_mode(_path: &Path) -> Result<u32> {
    Ok(DEFAULT_FILE_MODE)
}

#[cfg(unix)]
async fn symlink(target: &Path, link: &Path) -> Result<()> {
    fs::symlink(target, link).await?;
    Ok(())
}

#[cfg(windows)]
async fn symlink(target: &Path, link: &Path) -> Result<()> {
    fs::symlink_file(target, link).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::cipher::AesGcmCipher;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn roots() -> (TempDir, TempDir, SecureCopier) {
        let project = TempDir::new().unwrap();
        let session = TempDir::new().unwrap();
        let copier = SecureCopier::new(
            SandboxRoot::new(project.path()).unwrap(),
            SandboxRoot::new(session.path()).unwrap(),
        );
        (project, session, copier)
    }

    #[test]
    fn sensitive_patterns_match_expected_names() {
        assert!(is_sensitive(Path::new("config/master.key")));
        assert!(is_sensitive(Path::new("config/credentials/production.key")));
        assert!(is_sensitive(Path::new(".env.api_key")));
        assert!(is_sensitive(Path::new("AUTH_TOKEN.txt")));
        assert!(is_sensitive(Path::new("client_SECRET.json")));
        assert!(!is_sensitive(Path::new("README.md")));
        assert!(!is_sensitive(Path::new("src/main.rs")));
    }

    #[test]
    fn explicit_option_overrides_sensitivity() {
        assert!(should_encrypt(Path::new("config/master.key"), None));
        assert!(!should_encrypt(Path::new("config/master.key"), Some(false)));
        assert!(should_encrypt(Path::new("README.md"), Some(true)));
        assert!(!should_encrypt(Path::new("README.md"), None));
    }

    #[tokio::test]
    async fn copies_plain_file_with_default_mode() {
        let (project, session, copier) = roots();
        std::fs::write(project.path().join("notes.txt"), b"hello").unwrap();

        let result = copier
            .copy_file(Path::new("notes.txt"), None, &CopyOptions::default())
            .await
            .unwrap();

        assert_eq!(result.operation, CopyOperation::Copy);
        assert!(!result.encrypted);
        let copied = std::fs::read(session.path().join("notes.txt")).unwrap();
        assert_eq!(copied, b"hello");
        #[cfg(unix)]
        {
            let mode = std::fs::metadata(session.path().join("notes.txt"))
                .unwrap()
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(mode, DEFAULT_FILE_MODE);
        }
    }

    #[tokio::test]
    async fn sensitive_file_gets_tight_mode_without_cipher_when_encrypt_disabled() {
        let (project, session, copier) = roots();
        std::fs::create_dir_all(project.path().join("config")).unwrap();
        std::fs::write(project.path().join("config/master.key"), b"abcd").unwrap();

        let options = CopyOptions {
            encrypt: Some(false),
            ..CopyOptions::default()
        };
        copier
            .copy_file(Path::new("config/master.key"), None, &options)
            .await
            .unwrap();

        #[cfg(unix)]
        {
            let mode = std::fs::metadata(session.path().join("config/master.key"))
                .unwrap()
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(mode, SENSITIVE_FILE_MODE);
        }
    }

    #[tokio::test]
    async fn encrypts_sensitive_file_when_cipher_present() {
        let (project, session, _) = roots();
        std::fs::create_dir_all(project.path().join("config")).unwrap();
        std::fs::write(project.path().join("config/master.key"), b"abcd").unwrap();

        let cipher = Arc::new(AesGcmCipher::new(AesGcmCipher::generate_key()));
        let copier = SecureCopier::new(
            SandboxRoot::new(project.path()).unwrap(),
            SandboxRoot::new(session.path()).unwrap(),
        )
        .with_cipher(cipher.clone());

        let result = copier
            .copy_file(Path::new("config/master.key"), None, &CopyOptions::default())
            .await
            .unwrap();

        assert!(result.encrypted);
        let on_disk = std::fs::read(session.path().join("config/master.key")).unwrap();
        assert_ne!(on_disk, b"abcd");
        assert_eq!(cipher.decrypt(&on_disk).unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn encryption_without_cipher_is_an_error() {
        let (project, _session, copier) = roots();
        std::fs::write(project.path().join("x"), b"x").unwrap();

        let options = CopyOptions {
            encrypt: Some(true),
            ..CopyOptions::default()
        };
        let err = copier
            .copy_file(Path::new("x"), None, &options)
            .await
            .unwrap_err();
        assert!(matches!(err, SxnErr::Encryption { .. }), "{err}");
    }

    #[tokio::test]
    async fn missing_source_is_source_missing() {
        let (_project, _session, copier) = roots();
        let err = copier
            .copy_file(Path::new("nope.txt"), None, &CopyOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SxnErr::SourceMissing { .. }), "{err}");
    }

    #[tokio::test]
    async fn existing_destination_requires_force() {
        let (project, session, copier) = roots();
        std::fs::write(project.path().join("a.txt"), b"new").unwrap();
        std::fs::write(session.path().join("a.txt"), b"old").unwrap();

        let err = copier
            .copy_file(Path::new("a.txt"), None, &CopyOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SxnErr::DestinationExists { .. }), "{err}");

        let options = CopyOptions {
            force: true,
            ..CopyOptions::default()
        };
        let result = copier
            .copy_file(Path::new("a.txt"), None, &options)
            .await
            .unwrap();
        let backup = result.backup_path.unwrap();
        assert_eq!(std::fs::read(&backup).unwrap(), b"old");
        assert_eq!(std::fs::read(session.path().join("a.txt")).unwrap(), b"new");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_points_at_canonical_source() {
        let (project, session, copier) = roots();
        std::fs::write(project.path().join(".env"), b"KEY=1").unwrap();

        let result = copier
            .create_symlink(Path::new(".env"), None, &CopyOptions::default())
            .await
            .unwrap();

        assert_eq!(result.operation, CopyOperation::Symlink);
        let link = session.path().join(".env");
        let target = std::fs::read_link(&link).unwrap();
        assert!(target.is_absolute());
        assert_eq!(std::fs::read(&link).unwrap(), b"KEY=1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn chmod_changes_mode_of_existing_destination() {
        let (_project, session, copier) = roots();
        std::fs::write(session.path().join("script.sh"), b"echo hi").unwrap();

        let result = copier.chmod(Path::new("script.sh"), 0o755).await.unwrap();
        assert_eq!(result.operation, CopyOperation::Chmod);

        let mode = std::fs::metadata(session.path().join("script.sh"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o755);

        let err = copier.chmod(Path::new("missing.sh"), 0o600).await.unwrap_err();
        assert!(matches!(err, SxnErr::Io(_)), "{err}");
    }

    #[tokio::test]
    async fn checksum_matches_destination_bytes() {
        let (project, session, copier) = roots();
        std::fs::write(project.path().join("data.bin"), b"abcd").unwrap();

        let result = copier
            .copy_file(Path::new("data.bin"), None, &CopyOptions::default())
            .await
            .unwrap();

        let on_disk = std::fs::read(session.path().join("data.bin")).unwrap();
        assert_eq!(
            result.checksum.unwrap(),
            hex::encode(Sha256::digest(&on_disk))
        );
    }
}

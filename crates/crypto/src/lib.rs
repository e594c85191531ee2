use anyhow::{Context, Result};
use secrecy::SecretVec;
use std::io::Read;

/// Reads x25519 identities from an age identity file (`age-keygen` output).
/// Blank lines and `#` comments are skipped.
pub fn load_identities(path: &std::path::Path) -> Result<Vec<age::x25519::Identity>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("open identity {}", path.display()))?;
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .enumerate()
        .map(|(i, l)| {
            l.parse::<age::x25519::Identity>()
                .map_err(|e| anyhow::anyhow!("{}: identity {}: {}", path.display(), i + 1, e))
        })
        .collect()
}

/// Decrypts an age-encrypted stream. The plaintext stays in a `SecretVec` until parsed.
pub fn decrypt_age_bytes(rdr: impl Read, ids: &[age::x25519::Identity]) -> Result<SecretVec<u8>> {
    if ids.is_empty() {
        anyhow::bail!("encrypted config needs at least one --age-identity");
    }
    let decryptor = age::Decryptor::new(rdr).context("read age header")?;
    if decryptor.is_scrypt() {
        anyhow::bail!("passphrase-encrypted configs are not supported; use an x25519 recipient");
    }
    let mut plain = decryptor
        .decrypt(ids.iter().map(|i| i as &dyn age::Identity))
        .context("no identity matched the encrypted config")?;
    let mut out = Vec::new();
    plain.read_to_end(&mut out).context("decrypt config")?;
    Ok(SecretVec::new(out))
}

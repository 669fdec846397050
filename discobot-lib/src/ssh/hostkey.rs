//! SSH host key: load from disk, or generate a 4096-bit RSA key on first
//! start and persist it with tight permissions (dir 0700, file 0600).

use std::path::Path;

use rand::rngs::OsRng;
use ssh_key::private::{KeypairData, RsaKeypair};
use ssh_key::{LineEnding, PrivateKey};

use crate::error::{Error, Result};

const RSA_BITS: usize = 4096;

pub fn load_or_generate(path: &Path) -> Result<russh_keys::PrivateKey> {
    if !path.exists() {
        generate(path)?;
    }
    russh_keys::load_secret_key(path, None)
        .map_err(|err| Error::Internal(format!("failed to load SSH host key: {err}")))
}

fn generate(path: &Path) -> Result<()> {
    let keypair = RsaKeypair::random(&mut OsRng, RSA_BITS)
        .map_err(|err| Error::Internal(format!("host key generation failed: {err}")))?;
    let key = PrivateKey::new(KeypairData::Rsa(keypair), "discobot-ssh-gateway")
        .map_err(|err| Error::Internal(format!("host key generation failed: {err}")))?;
    let pem = key
        .to_openssh(LineEnding::LF)
        .map_err(|err| Error::Internal(format!("host key encoding failed: {err}")))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|err| Error::Internal(format!("failed to create key directory: {err}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700));
        }
    }
    std::fs::write(path, pem.as_bytes())
        .map_err(|err| Error::Internal(format!("failed to write host key: {err}")))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    Ok(())
}

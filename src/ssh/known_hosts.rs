//! Known hosts management for SSH host key verification

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches known_hosts entry
    Verified,
    /// Host not in known_hosts (first connection)
    Unknown { fingerprint: String },
    /// Key changed from known_hosts entry (potential MITM)
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

/// Entry in known_hosts: (key_type, base64_key)
#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

/// known_hosts file with an in-memory index
pub struct KnownHostsStore {
    /// Lookup key (`host` or `[host]:port`) -> stored keys
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    path: PathBuf,
}

impl KnownHostsStore {
    /// Load from ~/.ssh/known_hosts
    pub fn new() -> Self {
        let path = dirs::home_dir()
            .map(|h| h.join(".ssh").join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from("known_hosts"));
        Self::with_path(path)
    }

    /// Load from a custom path
    pub fn with_path(path: PathBuf) -> Self {
        let store = Self {
            hosts: RwLock::new(HashMap::new()),
            path,
        };

        if let Err(e) = store.load() {
            warn!("Failed to load known_hosts {}: {}", store.path.display(), e);
        }

        store
    }

    fn load(&self) -> std::io::Result<()> {
        if !self.path.exists() {
            debug!("No known_hosts at {}", self.path.display());
            return Ok(());
        }

        let reader = BufReader::new(fs::File::open(&self.path)?);
        let mut hosts = self.hosts.write();
        let mut entry_count = 0;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // hostname[,alias] keytype base64key [comment]
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }

            let entry = HostKeyEntry {
                key_type: parts[1].to_string(),
                key_data: parts[2].to_string(),
            };

            for hostname in parts[0].split(',') {
                // Hashed hostnames (|1|...) are not supported
                if hostname.starts_with('|') {
                    continue;
                }
                hosts
                    .entry(Self::normalize_hostname(hostname))
                    .or_default()
                    .push(entry.clone());
                entry_count += 1;
            }
        }

        info!(
            "Loaded {} known host entries ({} unique hosts)",
            entry_count,
            hosts.len()
        );
        Ok(())
    }

    /// `[host]:port` or `host` from a known_hosts field, in lookup-key form
    fn normalize_hostname(field: &str) -> String {
        if let Some(rest) = field.strip_prefix('[') {
            if let Some((host, port)) = rest.split_once("]:") {
                if let Ok(port) = port.parse::<u16>() {
                    return Self::make_key(host, port);
                }
            }
            return rest.trim_end_matches(']').to_lowercase();
        }
        field.to_lowercase()
    }

    /// Create lookup key for host:port
    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// Compute SHA256 fingerprint of public key
    pub fn fingerprint(key: &PublicKey) -> String {
        Self::fingerprint_bytes(&key.public_key_bytes())
    }

    fn fingerprint_bytes(bytes: &[u8]) -> String {
        let hash = Sha256::digest(bytes);
        format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
    }

    /// Verify a host's public key
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        self.verify_raw(
            host,
            port,
            key.algorithm().as_str(),
            &BASE64.encode(key.public_key_bytes()),
        )
    }

    fn verify_raw(&self, host: &str, port: u16, key_type: &str, key_b64: &str) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        let fingerprint = BASE64
            .decode(key_b64)
            .map(|bytes| Self::fingerprint_bytes(&bytes))
            .unwrap_or_else(|_| "unknown".to_string());

        let hosts = self.hosts.read();
        let Some(entries) = hosts.get(&lookup_key) else {
            debug!("Unknown host: {}", lookup_key);
            return HostKeyVerification::Unknown { fingerprint };
        };

        for entry in entries.iter().filter(|e| e.key_type == key_type) {
            if entry.key_data == key_b64 {
                debug!("Host key verified for {} (type: {})", lookup_key, key_type);
                return HostKeyVerification::Verified;
            }
            let expected_fingerprint = BASE64
                .decode(&entry.key_data)
                .map(|bytes| Self::fingerprint_bytes(&bytes))
                .unwrap_or_else(|_| "unknown".to_string());
            warn!(
                "HOST KEY CHANGED for {} (type: {})! Expected {}, got {}",
                lookup_key, key_type, expected_fingerprint, fingerprint
            );
            return HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint: fingerprint,
            };
        }

        // Host known, but not for this key type
        debug!(
            "Host {} known but no {} key stored, treating as new",
            lookup_key, key_type
        );
        HostKeyVerification::Unknown { fingerprint }
    }

    /// Record a host key and append it to the file
    pub fn add_host(&self, host: &str, port: u16, key: &PublicKey) -> std::io::Result<()> {
        self.add_raw(host, port, key.algorithm().as_str(), &BASE64.encode(key.public_key_bytes()))
    }

    fn add_raw(&self, host: &str, port: u16, key_type: &str, key_b64: &str) -> std::io::Result<()> {
        let lookup_key = Self::make_key(host, port);

        self.hosts
            .write()
            .entry(lookup_key.clone())
            .or_default()
            .push(HostKeyEntry {
                key_type: key_type.to_string(),
                key_data: key_b64.to_string(),
            });

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{} {} {}", lookup_key, key_type, key_b64)?;

        info!(
            "Added host key for {} (type: {}) to known_hosts",
            lookup_key, key_type
        );
        Ok(())
    }
}

impl Default for KnownHostsStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const KEY_A: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl";
    const KEY_B: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIBbW1Y3g2mXnNWmZ1cS0bJ4hcZ7vGqk1xvC0VdS3bN0x";

    #[test]
    fn test_normalize_hostname() {
        assert_eq!(KnownHostsStore::normalize_hostname("GitHub.com"), "github.com");
        assert_eq!(KnownHostsStore::normalize_hostname("[github.com]:22"), "github.com");
        assert_eq!(
            KnownHostsStore::normalize_hostname("[server.example.com]:2222"),
            "[server.example.com]:2222"
        );
    }

    #[test]
    fn test_make_key() {
        assert_eq!(KnownHostsStore::make_key("github.com", 22), "github.com");
        assert_eq!(
            KnownHostsStore::make_key("server.com", 2222),
            "[server.com]:2222"
        );
    }

    #[test]
    fn test_verify_known_unknown_changed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        std::fs::write(
            &path,
            format!("# comment\nbastion,10.0.0.5 ssh-ed25519 {KEY_A}\n[bastion]:2222 ssh-ed25519 {KEY_A}\n"),
        )
        .unwrap();
        let store = KnownHostsStore::with_path(path);

        assert_eq!(
            store.verify_raw("bastion", 22, "ssh-ed25519", KEY_A),
            HostKeyVerification::Verified
        );
        assert_eq!(
            store.verify_raw("10.0.0.5", 22, "ssh-ed25519", KEY_A),
            HostKeyVerification::Verified
        );
        assert_eq!(
            store.verify_raw("bastion", 2222, "ssh-ed25519", KEY_A),
            HostKeyVerification::Verified
        );
        assert!(matches!(
            store.verify_raw("bastion", 22, "ssh-ed25519", KEY_B),
            HostKeyVerification::Changed { .. }
        ));
        assert!(matches!(
            store.verify_raw("other", 22, "ssh-ed25519", KEY_A),
            HostKeyVerification::Unknown { .. }
        ));
        // Different key type for a known host counts as new
        assert!(matches!(
            store.verify_raw("bastion", 22, "ssh-rsa", KEY_B),
            HostKeyVerification::Unknown { .. }
        ));
    }

    #[test]
    fn test_add_host_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ssh").join("known_hosts");
        let store = KnownHostsStore::with_path(path.clone());

        store.add_raw("new-host", 2200, "ssh-ed25519", KEY_A).unwrap();
        assert_eq!(
            store.verify_raw("new-host", 2200, "ssh-ed25519", KEY_A),
            HostKeyVerification::Verified
        );

        let reloaded = KnownHostsStore::with_path(path);
        assert_eq!(
            reloaded.verify_raw("new-host", 2200, "ssh-ed25519", KEY_A),
            HostKeyVerification::Verified
        );
    }

    #[test]
    fn test_fingerprint_format() {
        let bytes = BASE64.decode(KEY_A).unwrap();
        let fp = KnownHostsStore::fingerprint_bytes(&bytes);
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
    }
}

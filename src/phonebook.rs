//! Phonebook: E.164 number → caller identity
//!
//! Loaded from a JSON file at startup (map from E.164 string to
//! `{name, role, email?, language?}`) and reloadable on SIGHUP. Read-mostly;
//! lookups clone the entry so the lock is never held past the call site.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{Language, Peer, PeerRole};

/// One phonebook record as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhonebookEntry {
    pub name: String,
    pub role: PeerRole,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub language: Option<Language>,
}

/// Process-wide caller directory.
pub struct Phonebook {
    path: PathBuf,
    entries: RwLock<HashMap<String, PhonebookEntry>>,
}

impl Phonebook {
    /// Load the phonebook from `path`. A missing file is a startup fault;
    /// an operator who wants an empty book can provide `{}`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = Self::read_file(&path)?;
        info!(entries = entries.len(), path = %path.display(), "phonebook loaded");
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    fn read_file(path: &Path) -> Result<HashMap<String, PhonebookEntry>> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading phonebook {}", path.display()))?;
        let entries: HashMap<String, PhonebookEntry> =
            serde_json::from_str(&raw).context("phonebook is not valid JSON")?;
        for number in entries.keys() {
            if !crate::types::is_e164(number) {
                anyhow::bail!("phonebook key {number:?} is not an E.164 number");
            }
        }
        Ok(entries)
    }

    /// Re-read the file in place. Keeps the old entries if the new file is
    /// broken, so a bad edit cannot take calls down.
    pub fn reload(&self) -> Result<usize> {
        match Self::read_file(&self.path) {
            Ok(fresh) => {
                let count = fresh.len();
                *self.entries.write().expect("phonebook lock poisoned") = fresh;
                info!(entries = count, "phonebook reloaded");
                Ok(count)
            }
            Err(err) => {
                warn!(error = %err, "phonebook reload failed, keeping previous entries");
                Err(err)
            }
        }
    }

    /// Resolve a caller; unknown numbers become `PeerRole::Unknown`.
    pub fn lookup(&self, phone_number: &str) -> Peer {
        let entries = self.entries.read().expect("phonebook lock poisoned");
        match entries.get(phone_number) {
            Some(entry) => Peer {
                phone_number: phone_number.to_string(),
                name: Some(entry.name.clone()),
                role: entry.role,
                email: entry.email.clone(),
                language: entry.language.unwrap_or_default(),
            },
            None => Peer::unknown(phone_number),
        }
    }

    /// Find a person by (partial, case-insensitive) name. Used when a
    /// teammate names a customer and we need their number.
    pub fn find_by_name(&self, name: &str) -> Option<Peer> {
        let needle = name.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }
        let entries = self.entries.read().expect("phonebook lock poisoned");
        entries
            .iter()
            .find(|(_, entry)| {
                let candidate = entry.name.to_lowercase();
                candidate == needle
                    || candidate.split_whitespace().any(|part| part == needle)
                    || needle.split_whitespace().any(|part| candidate.contains(part))
            })
            .map(|(number, entry)| Peer {
                phone_number: number.clone(),
                name: Some(entry.name.clone()),
                role: entry.role,
                email: entry.email.clone(),
                language: entry.language.unwrap_or_default(),
            })
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("phonebook lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Install a SIGHUP handler that reloads this phonebook.
    #[cfg(unix)]
    pub fn watch_sighup(book: &std::sync::Arc<Self>) {
        let book = std::sync::Arc::clone(book);
        tokio::spawn(async move {
            let mut hup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(error = %err, "cannot install SIGHUP handler");
                    return;
                }
            };
            while hup.recv().await.is_some() {
                let _ = book.reload();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_book(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn lookup_known_customer() {
        let file = write_book(
            r#"{"+4917260734880": {"name": "Anna", "role": "customer", "language": "german"}}"#,
        );
        let book = Phonebook::load(file.path()).unwrap();
        let peer = book.lookup("+4917260734880");
        assert_eq!(peer.name.as_deref(), Some("Anna"));
        assert_eq!(peer.role, PeerRole::Customer);
        assert_eq!(peer.language, Language::German);
    }

    #[test]
    fn lookup_unknown_number() {
        let file = write_book("{}");
        let book = Phonebook::load(file.path()).unwrap();
        let peer = book.lookup("+19998887777");
        assert_eq!(peer.role, PeerRole::Unknown);
        assert!(peer.name.is_none());
    }

    #[test]
    fn rejects_non_e164_keys() {
        let file = write_book(r#"{"017260734880": {"name": "Anna", "role": "customer"}}"#);
        assert!(Phonebook::load(file.path()).is_err());
    }

    #[test]
    fn find_by_name_is_case_insensitive() {
        let file = write_book(
            r#"{"+4915112345678": {"name": "James Miller", "role": "customer"}}"#,
        );
        let book = Phonebook::load(file.path()).unwrap();
        let peer = book.find_by_name("james").unwrap();
        assert_eq!(peer.phone_number, "+4915112345678");
        assert!(book.find_by_name("Nobody").is_none());
        assert!(book.find_by_name("").is_none());
    }

    #[test]
    fn reload_keeps_old_entries_on_bad_file() {
        let mut file = write_book(
            r#"{"+4917260734880": {"name": "Anna", "role": "customer"}}"#,
        );
        let book = Phonebook::load(file.path()).unwrap();
        assert_eq!(book.len(), 1);

        file.as_file_mut().set_len(0).unwrap();
        file.write_all(b"not json").unwrap();
        file.flush().unwrap();

        assert!(book.reload().is_err());
        assert_eq!(book.len(), 1);
    }
}
